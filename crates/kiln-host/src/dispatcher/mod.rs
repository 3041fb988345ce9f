//! The dispatcher: admission, routing, broadcast-load, cancellation, and
//! callback delivery.
//!
//! The dispatcher is the service's external API. It owns the code-entry
//! and pending-load tables; the worker pool owns the worker table; the
//! two never share locks. Admission is synchronous and non-blocking:
//! callers get an immediate verdict (a uuid, or `QueueFull`/
//! `InvalidArgument`/`NotFound`), and everything after admission happens
//! on a spawned task that suspends only on worker acquisition, worker
//! I/O, or its watchdog.
//!
//! # Execute lifecycle
//!
//! ```text
//! Admitted → Queued → AssignedToWorker → Running → Done{...}
//! ```
//!
//! The callback slot in the request context is consumed exactly once, by
//! whichever of completion, timeout, cancellation, or worker loss gets
//! there first.
//!
//! # Broadcast load
//!
//! A load fans out to `n` workers runner-side. Each worker's first
//! rendezvous connection (or the runner's terminal spawn failure) records
//! one slot in a fixed-size outcome array; when the last slot fills, the
//! aggregate resolves success only if every slot succeeded, else with the
//! first recorded failure, and the failed token's workers are torn down.

mod entry;

pub use entry::{
    BatchCallback, ExecuteCallback, ExecuteOutcome, LoadSource, LoadSpec, ResponsePayload,
    UdfRequest, UdfResponse,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use entry::{CodeEntry, ExecPhase, PendingLoad, RequestContext, failure_outcome};
use futures::{SinkExt, StreamExt};
use kiln_core::messages::{ExecRequest, ExecStatus, LoadBinary, WireMessage};
use kiln_core::tags::{self, Severity};
use kiln_core::{CodeToken, DispatchError, DispatchResult, ExecutionToken, ServiceConfig};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::HostEvent;
use crate::functions::FunctionRegistry;
use crate::logs;
use crate::pool::{AcquireError, ActiveWorker, ReleaseOutcome, Ticket, WorkerPool};
use crate::runner::{ControlClient, ControlError};
use crate::sideband::{Metadata, Sideband, SidebandEntry};
use crate::watchdog::{Interrupt, Watchdog};

/// The dispatch core. Shared as `Arc`; every method is `&self`.
pub struct Dispatcher {
    config: ServiceConfig,
    pool: Arc<WorkerPool>,
    control: ControlClient,
    sideband: Arc<Sideband<SidebandEntry>>,
    functions: Arc<FunctionRegistry>,
    entries: Mutex<HashMap<CodeToken, CodeEntry>>,
    pending_loads: Mutex<HashMap<CodeToken, PendingLoad>>,
    contexts: Mutex<HashMap<ExecutionToken, Arc<RequestContext>>>,
}

impl Dispatcher {
    /// Assembles a dispatcher over its collaborators.
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        pool: Arc<WorkerPool>,
        control: ControlClient,
        sideband: Arc<Sideband<SidebandEntry>>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            config,
            pool,
            control,
            sideband,
            functions,
            entries: Mutex::new(HashMap::new()),
            pending_loads: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// The pool this dispatcher routes through.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The metadata sideband.
    #[must_use]
    pub fn sideband(&self) -> &Arc<Sideband<SidebandEntry>> {
        &self.sideband
    }

    /// Asks the runner to drain and exit; used by the service façade at
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns the control-channel failure, mapped for the caller.
    pub async fn shutdown_runner(&self) -> DispatchResult<()> {
        self.control.shutdown().await.map_err(control_error)
    }

    /// Spawns the event-aggregation task consuming acceptor and runner
    /// events.
    pub fn spawn_event_task(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<HostEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.handle_event(event);
            }
            debug!("event channel closed");
        })
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<CodeToken, CodeEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CodeToken, PendingLoad>> {
        self.pending_loads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_contexts(&self) -> MutexGuard<'_, HashMap<ExecutionToken, Arc<RequestContext>>> {
        self.contexts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::WorkerConnected { code_token, .. } => {
                let mut pending = self.lock_pending();
                if let Some(load) = pending.get_mut(&code_token) {
                    if load.record(Ok(())) {
                        pending.remove(&code_token);
                    }
                }
            }
            HostEvent::SpawnFailed {
                code_token,
                message,
            } => {
                warn!(%code_token, %message, "worker spawn failed");
                let mut pending = self.lock_pending();
                if let Some(load) = pending.get_mut(&code_token) {
                    if load.record(Err(message)) {
                        pending.remove(&code_token);
                    }
                }
            }
            HostEvent::EntryUnhealthy { code_token } => {
                warn!(%code_token, "entry unhealthy: startup respawns exhausted");
                if let Some(entry) = self.lock_entries().get_mut(&code_token) {
                    entry.unhealthy = true;
                }
                self.pool.mark_unhealthy(&code_token);
                let mut pending = self.lock_pending();
                if let Some(load) = pending.get_mut(&code_token) {
                    load.abort("workers for token are unhealthy".to_owned());
                    pending.remove(&code_token);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Loads a UDF, bringing up its workers, and returns its token once
    /// every worker is Idle.
    ///
    /// All-or-nothing: if any worker fails to come up, the load fails and
    /// every worker already spawned for the token is torn down.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad spec, `WorkerUnavailable` when worker
    /// bring-up failed, `Internal` on control-channel loss.
    pub async fn load(self: &Arc<Self>, spec: LoadSpec) -> DispatchResult<CodeToken> {
        let worker_count = spec.worker_count.unwrap_or(self.config.default_worker_count);
        if worker_count == 0 {
            return Err(DispatchError::InvalidArgument(
                "worker_count must be positive".to_owned(),
            ));
        }
        let loader_kind = spec.source.loader_kind();
        let (binary_content, js_source, wasm_blob) = match spec.source {
            LoadSource::BinaryPath(path) => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    DispatchError::InvalidArgument(format!(
                        "cannot read binary {}: {e}",
                        path.display()
                    ))
                })?;
                (bytes, Vec::new(), Vec::new())
            }
            LoadSource::BinaryBytes(bytes) => {
                if bytes.is_empty() {
                    return Err(DispatchError::InvalidArgument(
                        "binary content is empty".to_owned(),
                    ));
                }
                (bytes, Vec::new(), Vec::new())
            }
            LoadSource::Javascript { source, wasm } => {
                if self.config.engine_shim.is_none() {
                    return Err(DispatchError::InvalidArgument(
                        "no engine shim configured for javascript entries".to_owned(),
                    ));
                }
                (Vec::new(), source, wasm.unwrap_or_default())
            }
            LoadSource::Wasm(wasm) => {
                if self.config.engine_shim.is_none() {
                    return Err(DispatchError::InvalidArgument(
                        "no engine shim configured for wasm entries".to_owned(),
                    ));
                }
                (Vec::new(), Vec::new(), wasm)
            }
        };

        let token = CodeToken::generate();
        let receiver = self.begin_load(&token, worker_count, spec.log_egress, loader_kind, None);
        let message = LoadBinary {
            request_id: 0,
            code_token: token.to_string(),
            binary_content,
            n_workers: u32::try_from(worker_count)
                .map_err(|_| DispatchError::InvalidArgument("worker_count too large".to_owned()))?,
            enable_log_egress: spec.log_egress,
            source_code_token: String::new(),
            loader_kind: loader_kind as i32,
            js_source,
            wasm_blob,
        };
        self.finish_load(token, message, receiver).await
    }

    /// Creates a log-egress alias of an already loaded entry.
    ///
    /// The alias shares the staged payload (hard-linked runner-side) and
    /// keeps working after the original token is deleted.
    ///
    /// # Errors
    ///
    /// `NotFound` when the source token is unknown or already deleted;
    /// otherwise as [`Dispatcher::load`].
    pub async fn load_for_logging(
        self: &Arc<Self>,
        source: &CodeToken,
        worker_count: Option<usize>,
    ) -> DispatchResult<CodeToken> {
        let (worker_count, loader_kind) = {
            let mut entries = self.lock_entries();
            let source_entry = entries.get_mut(source).ok_or_else(|| {
                DispatchError::NotFound(format!("unknown code token {source}"))
            })?;
            if source_entry.unhealthy {
                return Err(DispatchError::WorkerUnavailable(
                    "source entry is unhealthy".to_owned(),
                ));
            }
            source_entry.alias_refs += 1;
            (
                worker_count.unwrap_or(source_entry.worker_count),
                source_entry.loader_kind,
            )
        };
        if worker_count == 0 {
            self.drop_alias_ref(source);
            return Err(DispatchError::InvalidArgument(
                "worker_count must be positive".to_owned(),
            ));
        }

        let token = CodeToken::generate();
        let receiver = self.begin_load(
            &token,
            worker_count,
            true,
            loader_kind,
            Some(source.clone()),
        );
        let message = LoadBinary {
            request_id: 0,
            code_token: token.to_string(),
            binary_content: Vec::new(),
            n_workers: u32::try_from(worker_count)
                .map_err(|_| DispatchError::InvalidArgument("worker_count too large".to_owned()))?,
            enable_log_egress: true,
            source_code_token: source.to_string(),
            loader_kind: loader_kind as i32,
            js_source: Vec::new(),
            wasm_blob: Vec::new(),
        };
        let result = self.finish_load(token, message, receiver).await;
        if result.is_err() {
            self.drop_alias_ref(source);
        }
        result
    }

    fn begin_load(
        &self,
        token: &CodeToken,
        worker_count: usize,
        log_egress: bool,
        loader_kind: kiln_core::LoaderKind,
        alias_of: Option<CodeToken>,
    ) -> tokio::sync::oneshot::Receiver<Result<(), String>> {
        self.lock_entries().insert(
            token.clone(),
            CodeEntry {
                loader_kind,
                worker_count,
                log_egress,
                alias_of,
                alias_refs: 0,
                unhealthy: false,
                active: Arc::new(AtomicUsize::new(0)),
                created_at: Instant::now(),
            },
        );
        self.pool.register_token(token, worker_count);
        let (pending, receiver) = PendingLoad::new(worker_count);
        self.lock_pending().insert(token.clone(), pending);
        receiver
    }

    async fn finish_load(
        self: &Arc<Self>,
        token: CodeToken,
        message: LoadBinary,
        receiver: tokio::sync::oneshot::Receiver<Result<(), String>>,
    ) -> DispatchResult<CodeToken> {
        if let Err(e) = self.control.load_binary(message).await {
            self.teardown_failed_load(&token);
            return Err(control_error(e));
        }
        match receiver.await {
            Ok(Ok(())) => {
                info!(%token, "load complete; all workers idle");
                Ok(token)
            }
            Ok(Err(message)) => {
                self.teardown_failed_load(&token);
                Err(DispatchError::WorkerUnavailable(format!(
                    "load failed: {message}"
                )))
            }
            Err(_) => {
                self.teardown_failed_load(&token);
                Err(DispatchError::Internal(
                    "load aggregation dropped".to_owned(),
                ))
            }
        }
    }

    /// Removes every trace of a token whose load failed, including any
    /// workers that did come up.
    fn teardown_failed_load(self: &Arc<Self>, token: &CodeToken) {
        self.lock_entries().remove(token);
        self.lock_pending().remove(token);
        self.pool.terminate(token);
        let dispatcher = Arc::clone(self);
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.control.delete_binary(&token).await {
                debug!(%token, error = %e, "delete after failed load");
            }
        });
    }

    fn drop_alias_ref(&self, source: &CodeToken) {
        if let Some(entry) = self.lock_entries().get_mut(source) {
            entry.alias_refs = entry.alias_refs.saturating_sub(1);
        }
    }

    // ------------------------------------------------------------------
    // Execute
    // ------------------------------------------------------------------

    /// Admits one invocation. Returns its execution token synchronously;
    /// the callback fires exactly once later with the terminal outcome.
    ///
    /// # Errors
    ///
    /// Synchronous rejections only: `InvalidArgument` (empty handler,
    /// oversized metadata, malformed timeout tag), `NotFound` (unknown
    /// token), `QueueFull` (admission cap), `WorkerUnavailable`
    /// (respawn exhausted and no worker left). Rejected requests never
    /// invoke the callback.
    pub fn execute(
        self: &Arc<Self>,
        token: &CodeToken,
        request: UdfRequest,
        metadata: Metadata,
        callback: ExecuteCallback,
    ) -> DispatchResult<ExecutionToken> {
        if request.handler_name.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "handler name is empty".to_owned(),
            ));
        }
        let metadata_size: usize = metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
        if metadata_size > self.config.max_metadata_bytes {
            return Err(DispatchError::InvalidArgument(format!(
                "metadata of {metadata_size} bytes exceeds bound {}",
                self.config.max_metadata_bytes
            )));
        }
        let timeout = tags::timeout(&request.tags, self.config.default_execute_timeout)
            .map_err(|e| DispatchError::InvalidArgument(e.to_string()))?;

        // Reserve an admission slot under the entry table lock.
        let (active, log_egress) = {
            let entries = self.lock_entries();
            let entry = entries
                .get(token)
                .ok_or_else(|| DispatchError::NotFound(format!("unknown code token {token}")))?;
            let cap = self.config.admission_cap(entry.worker_count);
            if entry.active.load(Ordering::Acquire) >= cap {
                return Err(DispatchError::QueueFull(format!(
                    "{cap} executions already in flight for token"
                )));
            }
            entry.active.fetch_add(1, Ordering::AcqRel);
            (Arc::clone(&entry.active), entry.log_egress)
        };

        let uuid = ExecutionToken::generate();
        let min_log_level = request.min_log_level.unwrap_or(Severity::Info);
        let mut wire_tags = request.tags.clone();
        tags::stamp(&mut wire_tags, uuid.as_str(), min_log_level);
        if let Some(request_id) = &request.request_id {
            wire_tags
                .entry(tags::REQUEST_ID.to_owned())
                .or_insert_with(|| request_id.clone());
        }
        let raw_output = tags::wants_raw_output(&wire_tags);

        let displaced = self.sideband.insert(
            uuid.as_str(),
            SidebandEntry {
                metadata,
                min_log_level,
                request_id: request.request_id.clone(),
            },
        );
        if displaced.is_some() {
            active.fetch_sub(1, Ordering::AcqRel);
            self.sideband.remove(uuid.as_str());
            return Err(DispatchError::Internal("uuid collision".to_owned()));
        }

        // Claim the FIFO slot now so acquisition order follows admission
        // order regardless of task scheduling.
        let ticket = match self.pool.enqueue(token) {
            Ok(ticket) => ticket,
            Err(e) => {
                active.fetch_sub(1, Ordering::AcqRel);
                self.sideband.remove(uuid.as_str());
                return Err(match e {
                    AcquireError::UnknownToken => {
                        DispatchError::NotFound(format!("unknown code token {token}"))
                    }
                    _ => DispatchError::WorkerUnavailable(e.to_string()),
                });
            }
        };

        let deadline = Instant::now() + timeout;
        let ctx = Arc::new(RequestContext::new(
            uuid.clone(),
            token.clone(),
            deadline,
            callback,
        ));
        self.lock_contexts().insert(uuid.clone(), Arc::clone(&ctx));

        let exec_request = ExecRequest {
            uuid: uuid.to_string(),
            handler_name: request.handler_name,
            inputs: request.inputs,
            tags: wire_tags,
        };
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher
                .run_execute(ctx, ticket, exec_request, log_egress, raw_output, active)
                .await;
        });
        Ok(uuid)
    }

    /// Admits a batch. Per-request admission; the batch callback fires
    /// once with outcomes in submission order (admission rejections
    /// become outcomes rather than failing the batch).
    ///
    /// Returns the per-request admission results so callers can cancel
    /// individual requests.
    pub fn batch_execute(
        self: &Arc<Self>,
        token: &CodeToken,
        requests: Vec<UdfRequest>,
        metadata: &Metadata,
        callback: BatchCallback,
    ) -> Vec<DispatchResult<ExecutionToken>> {
        let total = requests.len();
        if total == 0 {
            callback(Vec::new());
            return Vec::new();
        }
        let outcomes: Arc<Mutex<Vec<Option<ExecuteOutcome>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let remaining = Arc::new(AtomicUsize::new(total));
        let batch_callback = Arc::new(Mutex::new(Some(callback)));

        let record = {
            let outcomes = Arc::clone(&outcomes);
            let remaining = Arc::clone(&remaining);
            let batch_callback = Arc::clone(&batch_callback);
            move |index: usize, outcome: ExecuteOutcome| {
                outcomes
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)[index] = Some(outcome);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected: Vec<ExecuteOutcome> = outcomes
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .iter_mut()
                        .map(|slot| slot.take().unwrap_or_else(|| {
                            failure_outcome(
                                DispatchError::Internal("missing batch outcome".to_owned()),
                                false,
                            )
                        }))
                        .collect();
                    if let Some(callback) = batch_callback
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .take()
                    {
                        callback(collected);
                    }
                }
            }
        };

        let mut admissions = Vec::with_capacity(total);
        for (index, request) in requests.into_iter().enumerate() {
            let closure_record = record.clone();
            let admitted = self.execute(
                token,
                request,
                metadata.clone(),
                Box::new(move |outcome| closure_record(index, outcome)),
            );
            if let Err(e) = &admitted {
                record(index, failure_outcome(e.clone(), false));
            }
            admissions.push(admitted);
        }
        admissions
    }

    /// Cancels an admitted request. Idempotent; cancelling a finished
    /// request is a no-op. A queued request is dequeued; a running one
    /// has its serving worker terminated, surfacing `Cancelled`.
    pub fn cancel(&self, uuid: &ExecutionToken) {
        if let Some(ctx) = self.lock_contexts().get(uuid) {
            debug!(%uuid, phase = ?ctx.phase(), "cancel requested");
            ctx.cancel.cancel();
        }
    }

    /// Deletes a loaded entry: drains its in-flight requests with
    /// `Cancelled`, terminates its workers, and removes the entry.
    /// Fire-and-forget; never fails observably. Aliases of the entry
    /// stay functional.
    pub fn delete(self: &Arc<Self>, token: &CodeToken) {
        let entry = self.lock_entries().remove(token);
        let Some(entry) = entry else {
            return;
        };
        info!(
            %token,
            age = ?entry.created_at.elapsed(),
            live_aliases = entry.alias_refs,
            "deleting entry"
        );
        if let Some(source) = &entry.alias_of {
            self.drop_alias_ref(source);
        }
        {
            let mut pending = self.lock_pending();
            if let Some(load) = pending.get_mut(token) {
                load.abort("token deleted during load".to_owned());
                pending.remove(token);
            }
        }
        // Drain in-flight requests before the workers disappear so they
        // surface Cancelled rather than TransportError.
        for ctx in self.lock_contexts().values() {
            if &ctx.code_token == token {
                ctx.cancel.cancel();
            }
        }
        self.pool.terminate(token);
        let dispatcher = Arc::clone(self);
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.control.delete_binary(&token).await {
                debug!(%token, error = %e, "runner delete failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // The execute task
    // ------------------------------------------------------------------

    async fn run_execute(
        self: Arc<Self>,
        ctx: Arc<RequestContext>,
        ticket: Ticket,
        request: ExecRequest,
        log_egress: bool,
        raw_output: bool,
        active: Arc<AtomicUsize>,
    ) {
        let watchdog = Watchdog::new(ctx.deadline, ctx.cancel.clone());
        let acquire_deadline =
            ctx.deadline.min(Instant::now() + self.config.acquire_timeout);

        // Resolve the ticket into a worker, racing the watchdog while
        // queued. Ready tickets already own their worker and resolve
        // without suspending.
        let acquired = if ticket.is_ready() {
            self.pool.redeem(ticket, &ctx.code_token, acquire_deadline).await
        } else {
            ctx.advance(ExecPhase::Queued);
            // The watchdog is polled first so a request deadline that
            // coincides with the acquire deadline reports Timeout, not
            // WorkerUnavailable.
            tokio::select! {
                biased;
                interrupt = watchdog.interrupted() => {
                    let error = match interrupt {
                        Interrupt::Deadline => {
                            DispatchError::Timeout("deadline before worker assignment".to_owned())
                        }
                        Interrupt::Cancelled => {
                            DispatchError::Cancelled("cancelled while queued".to_owned())
                        }
                    };
                    self.finish(&ctx, failure_outcome(error, log_egress), &active);
                    return;
                }
                worker = self.pool.redeem(ticket, &ctx.code_token, acquire_deadline) => worker,
            }
        };
        let mut worker = match acquired {
            Ok(worker) => worker,
            Err(e) => {
                let error = match e {
                    AcquireError::Deadline => DispatchError::WorkerUnavailable(
                        "no idle worker before deadline".to_owned(),
                    ),
                    AcquireError::Terminated => {
                        DispatchError::Cancelled("token deleted".to_owned())
                    }
                    AcquireError::Unhealthy => {
                        DispatchError::WorkerUnavailable("workers exhausted".to_owned())
                    }
                    AcquireError::UnknownToken => {
                        DispatchError::NotFound("token deleted".to_owned())
                    }
                };
                self.finish(&ctx, failure_outcome(error, log_egress), &active);
                return;
            }
        };
        ctx.advance(ExecPhase::AssignedToWorker);

        // A cancel that raced assignment: the worker never saw the
        // request, so it goes straight back to the pool.
        if ctx.cancel.is_cancelled() {
            self.pool.release(worker, ReleaseOutcome::Clean);
            self.finish(
                &ctx,
                failure_outcome(
                    DispatchError::Cancelled("cancelled before dispatch".to_owned()),
                    log_egress,
                ),
                &active,
            );
            return;
        }

        let worker_token = worker.execution_token.clone();
        if let Err(e) = worker
            .channel
            .send(Bytes::from(WireMessage::ExecRequest(request).encode()))
            .await
        {
            self.pool.release(worker, ReleaseOutcome::Faulted);
            let outcome = failure_outcome(
                DispatchError::TransportError(format!("request write failed: {e}")),
                log_egress,
            );
            self.finish_with_logs(&ctx, outcome, log_egress, &worker_token, &active)
                .await;
            return;
        }
        ctx.advance(ExecPhase::Running);

        let (result, release) = self
            .await_response(&ctx, &mut worker, &watchdog, raw_output, log_egress)
            .await;
        if matches!(release, ReleaseOutcome::Faulted) {
            // Make sure a hung worker actually dies; a worker that
            // crashed on its own is already gone and the kill is a
            // harmless no-op runner-side.
            if let Err(e) = self.control.cancel_execution(&worker_token).await {
                debug!(worker = %worker_token, error = %e, "worker kill failed");
            }
        }
        self.pool.release(worker, release);
        let outcome = ExecuteOutcome {
            result,
            logs: Err(DispatchError::Internal("logs unresolved".to_owned())),
        };
        self.finish_with_logs(&ctx, outcome, log_egress, &worker_token, &active)
            .await;
    }

    /// Waits for the response frame, servicing host-function callbacks
    /// and racing the watchdog.
    async fn await_response(
        &self,
        ctx: &Arc<RequestContext>,
        worker: &mut ActiveWorker,
        watchdog: &Watchdog,
        raw_output: bool,
        log_egress: bool,
    ) -> (DispatchResult<UdfResponse>, ReleaseOutcome) {
        loop {
            let frame = tokio::select! {
                frame = worker.channel.next() => frame,
                interrupt = watchdog.interrupted() => {
                    let error = match interrupt {
                        Interrupt::Deadline => DispatchError::Timeout(
                            "deadline fired while running".to_owned(),
                        ),
                        Interrupt::Cancelled => DispatchError::Cancelled(
                            "cancelled while running".to_owned(),
                        ),
                    };
                    return (Err(error), ReleaseOutcome::Faulted);
                }
            };
            let payload = match frame {
                None => {
                    return (
                        Err(DispatchError::TransportError(
                            "worker closed mid-request".to_owned(),
                        )),
                        ReleaseOutcome::Faulted,
                    );
                }
                Some(Err(e)) => {
                    return (
                        Err(DispatchError::TransportError(e.to_string())),
                        ReleaseOutcome::Faulted,
                    );
                }
                Some(Ok(payload)) => payload,
            };
            match WireMessage::decode(&payload) {
                Ok(WireMessage::ExecResponse(response)) => {
                    if response.uuid != ctx.uuid.as_str() {
                        return (
                            Err(DispatchError::TransportError(
                                "response uuid mismatch".to_owned(),
                            )),
                            ReleaseOutcome::Faulted,
                        );
                    }
                    return self.interpret_response(response, raw_output, log_egress);
                }
                Ok(WireMessage::CallbackRequest(callback)) => {
                    let reply = self.functions.route(&callback, &self.sideband);
                    if let Err(e) = worker
                        .channel
                        .send(Bytes::from(WireMessage::CallbackResponse(reply).encode()))
                        .await
                    {
                        return (
                            Err(DispatchError::TransportError(format!(
                                "callback reply failed: {e}"
                            ))),
                            ReleaseOutcome::Faulted,
                        );
                    }
                }
                Ok(other) => {
                    warn!(?other, "unexpected message from worker");
                    return (
                        Err(DispatchError::TransportError(
                            "unexpected message from worker".to_owned(),
                        )),
                        ReleaseOutcome::Faulted,
                    );
                }
                Err(e) => {
                    return (
                        Err(DispatchError::TransportError(e.to_string())),
                        ReleaseOutcome::Faulted,
                    );
                }
            }
        }
    }

    fn interpret_response(
        &self,
        response: kiln_core::messages::ExecResponse,
        raw_output: bool,
        log_egress: bool,
    ) -> (DispatchResult<UdfResponse>, ReleaseOutcome) {
        let clean = clean_release(log_egress);
        match ExecStatus::try_from(response.status) {
            Ok(ExecStatus::Ok) => {
                let payload = if raw_output {
                    ResponsePayload::Bytes(response.output)
                } else {
                    match String::from_utf8(response.output) {
                        Ok(text) => ResponsePayload::Json(text),
                        Err(_) => {
                            return (
                                Err(DispatchError::UdfFailure(
                                    "output is not valid UTF-8".to_owned(),
                                )),
                                clean,
                            );
                        }
                    }
                };
                (
                    Ok(UdfResponse {
                        payload,
                        metrics: response.metrics,
                    }),
                    clean,
                )
            }
            Ok(ExecStatus::HandlerError | ExecStatus::HandlerNotFound) => (
                Err(DispatchError::UdfFailure(response.error_message)),
                clean,
            ),
            Err(_) => (
                Err(DispatchError::TransportError(format!(
                    "unknown response status {}",
                    response.status
                ))),
                ReleaseOutcome::Faulted,
            ),
        }
    }

    /// Resolves the log side of an outcome and delivers it.
    async fn finish_with_logs(
        &self,
        ctx: &Arc<RequestContext>,
        mut outcome: ExecuteOutcome,
        log_egress: bool,
        worker_token: &ExecutionToken,
        active: &AtomicUsize,
    ) {
        outcome.logs = if log_egress {
            Ok(logs::read_and_reclaim(&self.config.log_dir, worker_token)
                .await
                .unwrap_or_default())
        } else {
            Err(DispatchError::NotFound(
                "token was loaded without log egress".to_owned(),
            ))
        };
        self.finish(ctx, outcome, active);
    }

    /// Terminal bookkeeping: sideband removal, context removal, admission
    /// slot release, and the exactly-once callback.
    fn finish(&self, ctx: &Arc<RequestContext>, outcome: ExecuteOutcome, active: &AtomicUsize) {
        self.sideband.remove(ctx.uuid.as_str());
        self.lock_contexts().remove(&ctx.uuid);
        active.fetch_sub(1, Ordering::AcqRel);
        if let Some(callback) = ctx.take_callback() {
            callback(outcome);
        } else {
            // Double-finish would mean two subsystems both thought they
            // owned the terminal transition.
            warn!(uuid = %ctx.uuid, "callback already consumed");
        }
    }
}

/// Egress release for entries that capture logs: the worker is retired so
/// the next request gets a fresh log file.
const fn clean_release(log_egress: bool) -> ReleaseOutcome {
    if log_egress {
        ReleaseOutcome::Retire
    } else {
        ReleaseOutcome::Clean
    }
}

fn control_error(e: ControlError) -> DispatchError {
    match e {
        ControlError::Rejected(message) => DispatchError::InvalidArgument(message),
        other => DispatchError::Internal(other.to_string()),
    }
}
