//! Worker-side runtime glue for UDF binaries.
//!
//! A UDF binary executed by the kiln runner receives one argument: the
//! decimal file-descriptor number of its connected host socket (the
//! rendezvous hello was already written by the runner before exec). The
//! binary's job from there is the per-request loop: read one framed
//! request, dispatch it to a handler, write one framed response, repeat
//! until the host closes the socket, then exit 0 so the runner respawns
//! a fresh worker.
//!
//! This crate is that loop. A UDF links it and implements [`UdfHandler`]:
//!
//! ```no_run
//! use kiln_udf::{HostPort, Invocation, UdfError, UdfHandler, serve_from_args};
//!
//! struct Greeter;
//!
//! impl UdfHandler for Greeter {
//!     fn handle(
//!         &mut self,
//!         invocation: &Invocation<'_>,
//!         _host: &mut HostPort<'_>,
//!     ) -> Result<Vec<u8>, UdfError> {
//!         match invocation.handler_name {
//!             "Sample" => Ok(b"\"Hello, world!\"".to_vec()),
//!             other => Err(UdfError::NoSuchHandler(other.to_owned())),
//!         }
//!     }
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     serve_from_args(Greeter)
//! }
//! ```
//!
//! The same trait is the seam for embedded engines: a JavaScript or wasm
//! engine shim implements [`UdfHandler`] over its isolate and reuses the
//! loop unchanged.

use std::collections::HashMap;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::process::ExitCode;
use std::time::Instant;

use kiln_core::framing::{FrameError, read_frame, write_frame};
use kiln_core::messages::{
    CallbackRequest, ExecRequest, ExecResponse, ExecStatus, WireMessage,
};
use kiln_core::MAX_FRAME_LEN;
pub use kiln_core::tags::Severity;

/// Metric key for wall-clock handler duration.
pub const METRIC_DURATION_NS: &str = "udf.handler_duration_ns";

/// One invocation as seen by the handler.
#[derive(Debug)]
pub struct Invocation<'a> {
    /// Requested handler name.
    pub handler_name: &'a str,
    /// Positional inputs.
    pub inputs: &'a [Vec<u8>],
    /// Request tags, including the host-stamped keys.
    pub tags: &'a HashMap<String, String>,
}

/// Errors a handler can return without killing the worker.
#[derive(Debug, thiserror::Error)]
pub enum UdfError {
    /// The requested handler name is not implemented.
    #[error("no handler named {0:?}")]
    NoSuchHandler(String),

    /// The handler ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// Fatal loop errors; any of these ends the worker process.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Missing or non-numeric fd argument.
    #[error("expected the socket fd as the sole argument")]
    BadFdArgument,

    /// Framing failure on the host socket.
    #[error("transport: {0}")]
    Frame(#[from] FrameError),

    /// The host sent something other than a request.
    #[error("unexpected message from host")]
    UnexpectedMessage,

    /// A host-function reply carried errors.
    #[error("host function failed: {0}")]
    Callback(String),

    /// A host-function reply answered a different uuid.
    #[error("host function reply uuid mismatch")]
    CallbackUuidMismatch,
}

/// The UDF entry point: one handler serving requests one at a time.
pub trait UdfHandler {
    /// Handles one invocation, returning the output payload.
    ///
    /// # Errors
    ///
    /// Returns [`UdfError`] for request-scoped failures; the worker
    /// stays alive and reports them as a structured error response.
    fn handle(
        &mut self,
        invocation: &Invocation<'_>,
        host: &mut HostPort<'_>,
    ) -> Result<Vec<u8>, UdfError>;
}

/// The handler's window back into the host, valid for one invocation.
///
/// Calls travel over the same framed socket as the request itself; the
/// host routes them by the request uuid and function name.
pub struct HostPort<'a> {
    stream: &'a mut UnixStream,
    uuid: &'a str,
}

impl HostPort<'_> {
    /// Invokes a registered host function and returns its payload.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError`] on transport failure or a host-side
    /// routing/handler error.
    pub fn call(&mut self, function_name: &str, payload: &[u8]) -> Result<Vec<u8>, ServeError> {
        let request = WireMessage::CallbackRequest(CallbackRequest {
            uuid: self.uuid.to_owned(),
            function_name: function_name.to_owned(),
            io_payload: payload.to_vec(),
        });
        write_frame(self.stream, &request.encode(), MAX_FRAME_LEN)?;
        let Some(frame) = read_frame(self.stream, MAX_FRAME_LEN)? else {
            return Err(ServeError::Frame(FrameError::TruncatedFrame {
                got: 0,
                want: 4,
            }));
        };
        match WireMessage::decode(&frame) {
            Ok(WireMessage::CallbackResponse(reply)) => {
                if reply.uuid != self.uuid {
                    return Err(ServeError::CallbackUuidMismatch);
                }
                if reply.errors.is_empty() {
                    Ok(reply.io_payload)
                } else {
                    Err(ServeError::Callback(reply.errors.join("; ")))
                }
            }
            Ok(_) => Err(ServeError::UnexpectedMessage),
            Err(_) => Err(ServeError::UnexpectedMessage),
        }
    }

    /// Sends one log line to the host's log binding.
    ///
    /// Lines below the request's severity floor are dropped host-side.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError`] on transport failure.
    pub fn log(&mut self, severity: Severity, message: &str) -> Result<(), ServeError> {
        let mut payload = Vec::with_capacity(1 + message.len());
        payload.push(severity.to_wire());
        payload.extend_from_slice(message.as_bytes());
        // Routing errors for the builtin are host bugs; surface them.
        self.call("kiln.log", &payload).map(|_| ())
    }
}

/// Serves requests from `stream` until the host closes it.
///
/// # Errors
///
/// Returns [`ServeError`] on transport failure; a clean host close is
/// `Ok(())` and the process should exit 0.
pub fn serve_on(mut stream: UnixStream, mut handler: impl UdfHandler) -> Result<(), ServeError> {
    loop {
        let Some(frame) = read_frame(&mut stream, MAX_FRAME_LEN)? else {
            // Host closed at a frame boundary: retirement, not failure.
            return Ok(());
        };
        let request = match WireMessage::decode(&frame) {
            Ok(WireMessage::ExecRequest(request)) => request,
            Ok(_) | Err(_) => return Err(ServeError::UnexpectedMessage),
        };
        let response = run_one(&mut stream, &mut handler, &request);
        // Captured output must land in the log file before the host
        // reads it, which happens as soon as the response arrives.
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        write_frame(
            &mut stream,
            &WireMessage::ExecResponse(response).encode(),
            MAX_FRAME_LEN,
        )?;
    }
}

fn run_one(
    stream: &mut UnixStream,
    handler: &mut impl UdfHandler,
    request: &ExecRequest,
) -> ExecResponse {
    let invocation = Invocation {
        handler_name: &request.handler_name,
        inputs: &request.inputs,
        tags: &request.tags,
    };
    let mut host = HostPort {
        stream,
        uuid: &request.uuid,
    };
    let started = Instant::now();
    let result = handler.handle(&invocation, &mut host);
    #[allow(clippy::cast_possible_truncation)] // 584 years of nanoseconds
    let duration_ns = started.elapsed().as_nanos() as u64;
    let mut metrics = HashMap::new();
    metrics.insert(METRIC_DURATION_NS.to_owned(), duration_ns);

    match result {
        Ok(output) => ExecResponse {
            uuid: request.uuid.clone(),
            status: ExecStatus::Ok as i32,
            output,
            error_message: String::new(),
            metrics,
        },
        Err(UdfError::NoSuchHandler(name)) => ExecResponse {
            uuid: request.uuid.clone(),
            status: ExecStatus::HandlerNotFound as i32,
            output: Vec::new(),
            error_message: format!("no handler named {name:?}"),
            metrics,
        },
        Err(UdfError::Failed(message)) => ExecResponse {
            uuid: request.uuid.clone(),
            status: ExecStatus::HandlerError as i32,
            output: Vec::new(),
            error_message: message,
            metrics,
        },
    }
}

/// Binary entry point: takes the socket fd from `argv[1]` and serves.
///
/// Returns the process exit code the runner expects: 0 after a clean
/// host close, non-zero on transport failure or a bad invocation.
#[must_use]
pub fn serve_from_args(handler: impl UdfHandler) -> ExitCode {
    let Some(fd) = std::env::args().nth(1).and_then(|arg| arg.parse::<i32>().ok()) else {
        eprintln!("usage: <udf> <socket-fd>");
        return ExitCode::FAILURE;
    };
    // Safety: the runner execs us with exactly this descriptor connected
    // and owned by no one else in this process.
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    match serve_on(stream, handler) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("worker loop failed: {e}");
            ExitCode::FAILURE
        }
    }
}
