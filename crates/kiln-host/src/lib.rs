//! Host side of the kiln UDF execution service.
//!
//! The host accepts Load/Execute/Cancel/Delete calls, routes them onto a
//! warm pool of sandboxed worker processes, and delivers each outcome to
//! its callback exactly once. Worker processes are cloned and supervised
//! by the separate `kiln-worker` runner binary; this crate owns the host
//! end of every transport and all dispatch state.
//!
//! Entry point: [`service::UdfService::start`], then
//! [`dispatcher::Dispatcher`] for the API. Embedders register host
//! functions (callable from inside UDFs) in a
//! [`functions::FunctionRegistry`] before starting the service.

pub mod blob;
pub mod dispatcher;
pub mod events;
pub mod functions;
pub mod logs;
pub mod pool;
pub mod runner;
pub mod service;
pub mod sideband;
pub mod watchdog;

pub use blob::UdfBlob;
pub use dispatcher::{
    Dispatcher, ExecuteCallback, ExecuteOutcome, LoadSource, LoadSpec, ResponsePayload,
    UdfRequest, UdfResponse,
};
pub use functions::FunctionRegistry;
pub use service::{ServiceError, UdfService};
pub use sideband::{Metadata, Sideband, SidebandEntry};
