//! Dispatcher-owned records: code entries, pending loads, and per-request
//! contexts.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use kiln_core::messages::LoaderKind;
use kiln_core::tags::Severity;
use kiln_core::{CodeToken, DispatchError, DispatchResult, ExecutionToken};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a load's payload comes from.
#[derive(Debug, Clone)]
pub enum LoadSource {
    /// Path of a native binary; read at load time.
    BinaryPath(std::path::PathBuf),
    /// Native binary bytes held by the caller.
    BinaryBytes(Vec<u8>),
    /// JavaScript source, optionally with a wasm blob staged alongside.
    Javascript {
        /// UTF-8 source.
        source: Vec<u8>,
        /// Optional wasm module the source instantiates.
        wasm: Option<Vec<u8>>,
    },
    /// A bare wasm module.
    Wasm(Vec<u8>),
}

impl LoadSource {
    /// Loader discriminant this source maps to.
    #[must_use]
    pub const fn loader_kind(&self) -> LoaderKind {
        match self {
            Self::BinaryPath(_) | Self::BinaryBytes(_) => LoaderKind::NativeBinary,
            Self::Javascript { wasm: None, .. } => LoaderKind::Javascript,
            Self::Javascript { wasm: Some(_), .. } => LoaderKind::JavascriptWithWasm,
            Self::Wasm(_) => LoaderKind::WasmOnly,
        }
    }
}

/// Caller-facing load request.
#[derive(Debug, Clone)]
pub struct LoadSpec {
    /// Payload to stage.
    pub source: LoadSource,
    /// Workers to bring up; `None` takes the configured default.
    pub worker_count: Option<usize>,
    /// Capture worker stdout/stderr per execution.
    pub log_egress: bool,
}

/// One invocation to run against a loaded entry.
#[derive(Debug, Clone, Default)]
pub struct UdfRequest {
    /// Handler to invoke inside the UDF.
    pub handler_name: String,
    /// Positional inputs.
    pub inputs: Vec<Vec<u8>>,
    /// Request tags; the dispatcher stamps the host-owned keys.
    pub tags: HashMap<String, String>,
    /// Severity floor for this request's log egress.
    pub min_log_level: Option<Severity>,
    /// Caller correlation id, mirrored into the tags.
    pub request_id: Option<String>,
}

/// Output of a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// UTF-8 JSON text (the default).
    Json(String),
    /// Raw bytes, selected by the `roma.input_type=bytes` tag.
    Bytes(Vec<u8>),
}

/// A completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdfResponse {
    /// Handler output.
    pub payload: ResponsePayload,
    /// Named durations in nanoseconds measured inside the worker.
    pub metrics: HashMap<String, u64>,
}

/// Everything a callback receives: the invocation result plus the log
/// blob. The log side is `NotFound` for entries loaded without egress.
#[derive(Debug)]
pub struct ExecuteOutcome {
    /// The invocation's terminal result.
    pub result: DispatchResult<UdfResponse>,
    /// Captured worker output, or why there is none.
    pub logs: DispatchResult<String>,
}

/// One-shot completion callback for an execute.
pub type ExecuteCallback = Box<dyn FnOnce(ExecuteOutcome) + Send + 'static>;

/// One-shot completion callback for a batch; outcomes are in submission
/// order.
pub type BatchCallback = Box<dyn FnOnce(Vec<ExecuteOutcome>) + Send + 'static>;

/// A loaded entry, keyed by its code token in the dispatcher's table.
pub(crate) struct CodeEntry {
    pub loader_kind: LoaderKind,
    pub worker_count: usize,
    pub log_egress: bool,
    /// Set for alias entries; names the entry this one was cloned from.
    pub alias_of: Option<CodeToken>,
    /// Live aliases cloned from this entry. The staged payload outlives
    /// the entry while this is non-zero (hard links keep it alive
    /// runner-side); the entry itself becomes undiscoverable at delete.
    pub alias_refs: usize,
    /// Startup respawns exhausted; executes fail `WorkerUnavailable`
    /// once the surviving workers drain.
    pub unhealthy: bool,
    /// Non-terminal executes, shared with their tasks for decrement
    /// after the entry may already be gone.
    pub active: Arc<AtomicUsize>,
    pub created_at: Instant,
}

/// Aggregation state for one broadcast load: per-worker outcome slots
/// and a completion channel. All-or-nothing: success only if every slot
/// records success; otherwise the first recorded failure wins.
pub(crate) struct PendingLoad {
    outcomes: Vec<Option<Result<(), String>>>,
    recorded: usize,
    done: Option<oneshot::Sender<Result<(), String>>>,
}

impl PendingLoad {
    /// Creates aggregation state expecting `expected` outcomes.
    pub fn new(expected: usize) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                outcomes: vec![None; expected],
                recorded: 0,
                done: Some(tx),
            },
            rx,
        )
    }

    /// Records one per-worker outcome. Returns true when the aggregate
    /// resolved (all slots filled) and the pending load can be dropped.
    pub fn record(&mut self, outcome: Result<(), String>) -> bool {
        if let Some(slot) = self.outcomes.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(outcome);
            self.recorded += 1;
        }
        if self.recorded < self.outcomes.len() {
            return false;
        }
        let aggregate = self
            .outcomes
            .iter()
            .flatten()
            .find_map(|o| o.as_ref().err().cloned())
            .map_or(Ok(()), Err);
        if let Some(done) = self.done.take() {
            let _ = done.send(aggregate);
        }
        true
    }

    /// Resolves the aggregate immediately with a failure (entry deleted
    /// or unhealthy mid-load).
    pub fn abort(&mut self, message: String) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(message));
        }
    }
}

/// Lifecycle of one admitted execute. Terminal is absorbing; the
/// callback slot is the synchronisation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecPhase {
    Queued,
    AssignedToWorker,
    Running,
    Done,
}

/// Per-request record, shared between the dispatcher table, the execute
/// task, and cancellation.
pub(crate) struct RequestContext {
    pub uuid: ExecutionToken,
    pub code_token: CodeToken,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    phase: Mutex<ExecPhase>,
    callback: Mutex<Option<ExecuteCallback>>,
}

impl RequestContext {
    pub fn new(
        uuid: ExecutionToken,
        code_token: CodeToken,
        deadline: Instant,
        callback: ExecuteCallback,
    ) -> Self {
        Self {
            uuid,
            code_token,
            deadline,
            cancel: CancellationToken::new(),
            phase: Mutex::new(ExecPhase::Queued),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Moves the request forward. Phases only advance; a stale transition
    /// after `Done` is ignored.
    pub fn advance(&self, phase: ExecPhase) {
        let mut current = self
            .phase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *current != ExecPhase::Done {
            *current = phase;
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ExecPhase {
        *self
            .phase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Consumes the callback slot, marking the request `Done`. Whichever
    /// subsystem gets here first wins; everyone else sees `None`.
    pub fn take_callback(&self) -> Option<ExecuteCallback> {
        let taken = self
            .callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if taken.is_some() {
            *self
                .phase
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = ExecPhase::Done;
        }
        taken
    }
}

/// Builds the failure outcome for a request that never produced logs.
pub(crate) fn failure_outcome(error: DispatchError, log_egress: bool) -> ExecuteOutcome {
    ExecuteOutcome {
        result: Err(error),
        logs: if log_egress {
            Ok(String::new())
        } else {
            Err(DispatchError::NotFound(
                "token was loaded without log egress".to_owned(),
            ))
        },
    }
}
