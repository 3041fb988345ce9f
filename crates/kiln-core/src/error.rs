//! Error kinds surfaced to callers of the execution service.
//!
//! Every terminal outcome of a load or execute maps onto exactly one
//! [`DispatchError`] variant. Lower layers keep their own error enums
//! (framing, control protocol, pool, sandbox) and convert at the dispatcher
//! boundary, so callers never see transport internals leak through.

/// Caller-visible error for load, execute, and log retrieval.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Missing token, missing handler, malformed request, or oversized
    /// metadata.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Admission refused due to backpressure: in-flight plus queued
    /// executions for the token reached `worker_count * worker_queue_cap`.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Unknown or deleted code token; also returned when logs are requested
    /// for a token registered without log egress.
    #[error("not found: {0}")]
    NotFound(String),

    /// Deadline fired before the worker responded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Explicit cancel, or a delete drained the request.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// No worker for the token could be acquired and respawn is exhausted.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The UDF exited non-zero or returned a structured error.
    #[error("udf failure: {0}")]
    UdfFailure(String),

    /// Framing error or unexpected close on the worker socket; treated
    /// identically to a worker crash.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The worker exceeded its configured heap ceiling.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Host-side invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Discriminant-only view of [`DispatchError`], for matching in callbacks
/// and tests without caring about messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    QueueFull,
    NotFound,
    Timeout,
    Cancelled,
    WorkerUnavailable,
    UdfFailure,
    TransportError,
    OutOfMemory,
    Internal,
}

impl DispatchError {
    /// Returns the discriminant for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::WorkerUnavailable(_) => ErrorKind::WorkerUnavailable,
            Self::UdfFailure(_) => ErrorKind::UdfFailure,
            Self::TransportError(_) => ErrorKind::TransportError,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for outcomes that indicate the serving worker must not be
    /// reused: the worker is forced `Gone` and replaced.
    ///
    /// A structured `UdfFailure` is excluded: the worker produced a
    /// well-formed error response and can keep serving.
    #[must_use]
    pub const fn poisons_worker(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Cancelled(_) | Self::TransportError(_) | Self::OutOfMemory(_)
        )
    }
}

/// Result alias for caller-facing operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
