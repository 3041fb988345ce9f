//! Host function registry and callback routing.
//!
//! Workers invoke host-owned functions mid-execution by sending a
//! [`CallbackRequest`] back over their transport. The host resolves the
//! request uuid in the sideband, routes by function name through this
//! registry, and replies with a [`CallbackResponse`] carrying the
//! function's payload or routing errors. Routing is a table lookup, not
//! dispatch over types: a function is a name bound to a closure.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kiln_core::messages::{CallbackRequest, CallbackResponse};
use kiln_core::tags::Severity;
use tracing::{debug, error, info, trace, warn};

use crate::sideband::{Sideband, SidebandEntry};

/// Error strings placed on [`CallbackResponse::errors`]. Wire contract
/// for UDF authors, so they are constants rather than formatted text.
pub const ERR_FUNCTION_NOT_FOUND: &str = "kiln: no host function registered under that name";
/// The uuid had no sideband entry (request already finished or never
/// admitted).
pub const ERR_METADATA_NOT_FOUND: &str = "kiln: no metadata for the invoking request";
/// The bound function returned an error.
pub const ERR_FUNCTION_FAILED: &str = "kiln: host function execution failed";

/// Name of the builtin log binding registered by
/// [`FunctionRegistry::with_log_binding`].
pub const LOG_FUNCTION: &str = "kiln.log";

/// A registered host function.
///
/// Receives the invoking request's sideband record and the opaque payload
/// from the worker; returns the reply payload or an error message that is
/// logged host-side (the worker sees only [`ERR_FUNCTION_FAILED`]).
pub type HostFunction =
    Box<dyn Fn(&SidebandEntry, &[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Errors from registry mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A function with this name is already bound.
    #[error("host function {0:?} is already registered")]
    Duplicate(String),
}

/// Table of host functions keyed by name.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, HostFunction>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the builtin log binding installed.
    #[must_use]
    pub fn with_log_binding() -> Self {
        let registry = Self::new();
        registry
            .register(LOG_FUNCTION, Box::new(log_binding))
            .unwrap_or_else(|_| unreachable!("empty registry has no duplicates"));
        registry
    }

    /// Binds `function` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the name is taken.
    pub fn register(&self, name: &str, function: HostFunction) -> Result<(), RegistryError> {
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if functions.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }
        functions.insert(name.to_owned(), function);
        Ok(())
    }

    /// Removes the binding under `name`, if any.
    pub fn unregister(&self, name: &str) -> bool {
        self.functions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Routes one worker callback to its bound function.
    ///
    /// Never fails: routing problems come back as `errors` on the
    /// response, mirroring what the worker-side glue expects.
    #[must_use]
    pub fn route(
        &self,
        request: &CallbackRequest,
        sideband: &Arc<Sideband<SidebandEntry>>,
    ) -> CallbackResponse {
        let mut response = CallbackResponse {
            uuid: request.uuid.clone(),
            io_payload: Vec::new(),
            errors: Vec::new(),
        };
        let functions = self
            .functions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(function) = functions.get(&request.function_name) else {
            debug!(function = %request.function_name, "callback for unknown function");
            response.errors.push(ERR_FUNCTION_NOT_FOUND.to_owned());
            return response;
        };
        let outcome = sideband.with_value(&request.uuid, |entry| {
            function(entry, &request.io_payload)
        });
        match outcome {
            None => {
                debug!(uuid = %request.uuid, "callback for request without sideband entry");
                response.errors.push(ERR_METADATA_NOT_FOUND.to_owned());
            }
            Some(Err(message)) => {
                warn!(
                    function = %request.function_name,
                    uuid = %request.uuid,
                    %message,
                    "host function failed"
                );
                response.errors.push(ERR_FUNCTION_FAILED.to_owned());
            }
            Some(Ok(payload)) => response.io_payload = payload,
        }
        response
    }
}

/// Builtin log binding: payload is one severity byte followed by UTF-8
/// message text. Messages below the request's severity floor are
/// dropped; the rest are re-emitted through the host's tracing
/// subscriber with the request id attached.
fn log_binding(entry: &SidebandEntry, payload: &[u8]) -> Result<Vec<u8>, String> {
    let (&level_byte, message) = payload
        .split_first()
        .ok_or_else(|| "empty log payload".to_owned())?;
    let severity =
        Severity::from_wire(level_byte).ok_or_else(|| format!("bad severity {level_byte}"))?;
    if severity < entry.min_log_level {
        return Ok(Vec::new());
    }
    let message = String::from_utf8_lossy(message);
    let request_id = entry.request_id.as_deref().unwrap_or("-");
    match severity {
        Severity::Trace => trace!(target: "kiln::udf", request_id, "{message}"),
        Severity::Debug => debug!(target: "kiln::udf", request_id, "{message}"),
        Severity::Info => info!(target: "kiln::udf", request_id, "{message}"),
        Severity::Warn => warn!(target: "kiln::udf", request_id, "{message}"),
        Severity::Error => error!(target: "kiln::udf", request_id, "{message}"),
    }
    Ok(Vec::new())
}
