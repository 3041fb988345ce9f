//! Host half of the worker pool.
//!
//! The runner process clones and supervises worker processes; this module
//! owns what the host sees of them: the rendezvous listener where fresh
//! workers present their tokens, the per-token FIFO idle queues, and the
//! worker state table. The dispatcher takes workers out with
//! [`WorkerPool::acquire`] and hands them back with
//! [`WorkerPool::release`]; the transport moves with the worker, so
//! exactly one task owns a worker's socket at any time.
//!
//! One std mutex guards the table. It is never held across an await, and
//! waiters are woken through one-shot channels queued in FIFO order, so
//! acquisition order per token follows admission order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use kiln_core::framing::FrameCodec;
use kiln_core::{CodeToken, ExecutionToken, TOKEN_LEN};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::events::HostEvent;

/// Framed transport for one worker connection.
pub type WorkerChannel = Framed<UnixStream, FrameCodec>;

/// Host-visible lifecycle of a worker.
///
/// `Spawning` exists only runner-side (the host first sees a worker at
/// rendezvous); `Gone` workers are removed from the table. Transitions
/// are linear per worker: Idle → Busy → {Idle, Gone} and any → Terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Idle,
    Busy,
    Terminating,
    Gone,
}

/// A worker checked out for exactly one request.
#[derive(Debug)]
pub struct ActiveWorker {
    /// Entry this worker serves.
    pub code_token: CodeToken,
    /// The worker's identity; names its log file and its kill handle.
    pub execution_token: ExecutionToken,
    /// The worker's transport, exclusively owned while checked out.
    pub channel: WorkerChannel,
}

/// How a checked-out worker came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Served cleanly; requeue as Idle.
    Clean,
    /// Served cleanly, but the worker must not be reused (log-egress
    /// entries get a fresh worker and a fresh log file per request).
    /// Dropping the transport makes the worker exit 0 and the runner
    /// respawn it.
    Retire,
    /// Crashed, timed out, or was cancelled: the worker is Gone and the
    /// runner replaces it.
    Faulted,
}

/// Why an acquire did not produce a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// Token never registered or already terminated.
    #[error("unknown code token")]
    UnknownToken,

    /// The deadline expired with no idle worker.
    #[error("no idle worker before deadline")]
    Deadline,

    /// The token was terminated while waiting.
    #[error("token terminated while waiting")]
    Terminated,

    /// Respawn for the token is exhausted and no idle worker remains.
    #[error("workers exhausted for token")]
    Unhealthy,
}

#[derive(Debug)]
struct IdleWorker {
    execution_token: ExecutionToken,
    channel: WorkerChannel,
}

/// A claimed place in a token's acquisition order.
///
/// Ready tickets already own their worker (it went Busy at enqueue) and
/// should be redeemed promptly, not dropped; waiting tickets resolve when
/// a worker frees up or the token is torn down.
#[derive(Debug)]
pub struct Ticket(TicketInner);

#[derive(Debug)]
enum TicketInner {
    Ready(ActiveWorker),
    Waiting(oneshot::Receiver<Result<IdleWorker, AcquireError>>),
}

impl Ticket {
    /// True when the ticket already owns its worker, making redeem
    /// immediate.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.0, TicketInner::Ready(_))
    }
}

type WaiterTx = oneshot::Sender<Result<IdleWorker, AcquireError>>;

struct TokenQueues {
    idle: VecDeque<IdleWorker>,
    waiters: VecDeque<WaiterTx>,
    target_workers: usize,
    unhealthy: bool,
}

#[derive(Default)]
struct PoolState {
    queues: HashMap<CodeToken, TokenQueues>,
    states: HashMap<ExecutionToken, WorkerState>,
}

/// The host-side pool. Cheap to share; all state sits behind one mutex.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    max_frame_len: usize,
}

impl WorkerPool {
    /// Creates an empty pool whose worker channels cap frames at
    /// `max_frame_len`.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_frame_len,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a token ahead of its workers connecting. Workers
    /// presenting unregistered tokens are turned away at rendezvous.
    pub fn register_token(&self, token: &CodeToken, target_workers: usize) {
        let mut state = self.lock();
        state.queues.entry(token.clone()).or_insert(TokenQueues {
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            target_workers,
            unhealthy: false,
        });
    }

    /// Adds a freshly connected worker, fulfilling the oldest live waiter
    /// or queueing it idle. Returns false when the token is unknown and
    /// the stream should be dropped.
    pub fn add_worker(
        &self,
        code_token: &CodeToken,
        execution_token: ExecutionToken,
        stream: UnixStream,
    ) -> bool {
        let channel = Framed::new(
            stream,
            FrameCodec::with_max_frame_len(self.max_frame_len),
        );
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(queues) = state.queues.get_mut(code_token) else {
            return false;
        };
        let mut worker = IdleWorker {
            execution_token,
            channel,
        };
        // Hand to the oldest waiter whose receiver is still alive.
        while let Some(waiter) = queues.waiters.pop_front() {
            match waiter.send(Ok(worker)) {
                Ok(()) => {
                    // Receiver marks itself Busy via `acquire`.
                    return true;
                }
                Err(Ok(returned)) => worker = returned,
                Err(Err(_)) => unreachable!("waiters only ever receive Ok here"),
            }
        }
        state
            .states
            .insert(worker.execution_token.clone(), WorkerState::Idle);
        queues.idle.push_back(worker);
        true
    }

    /// Claims a place in `token`'s FIFO acquisition order.
    ///
    /// The place is fixed synchronously at the call, so callers that
    /// enqueue in admission order are served in admission order no matter
    /// how their tasks interleave afterwards. Redeem the ticket with
    /// [`WorkerPool::redeem`].
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] when the token is unknown, or unhealthy
    /// with no idle worker left.
    pub fn enqueue(&self, token: &CodeToken) -> Result<Ticket, AcquireError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let queues = state
            .queues
            .get_mut(token)
            .ok_or(AcquireError::UnknownToken)?;
        if let Some(worker) = queues.idle.pop_front() {
            let execution_token = worker.execution_token.clone();
            state
                .states
                .insert(execution_token.clone(), WorkerState::Busy);
            return Ok(Ticket(TicketInner::Ready(ActiveWorker {
                code_token: token.clone(),
                execution_token,
                channel: worker.channel,
            })));
        }
        if queues.unhealthy {
            return Err(AcquireError::Unhealthy);
        }
        let (tx, rx) = oneshot::channel();
        queues.waiters.push_back(tx);
        Ok(Ticket(TicketInner::Waiting(rx)))
    }

    /// Waits on a ticket until `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] when the token was terminated or became
    /// unhealthy while waiting, or the deadline expires.
    pub async fn redeem(
        &self,
        ticket: Ticket,
        token: &CodeToken,
        deadline: Instant,
    ) -> Result<ActiveWorker, AcquireError> {
        let receiver = match ticket.0 {
            TicketInner::Ready(worker) => return Ok(worker),
            TicketInner::Waiting(rx) => rx,
        };
        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(Ok(worker))) => {
                let execution_token = worker.execution_token.clone();
                self.lock()
                    .states
                    .insert(execution_token.clone(), WorkerState::Busy);
                Ok(ActiveWorker {
                    code_token: token.clone(),
                    execution_token,
                    channel: worker.channel,
                })
            }
            Ok(Ok(Err(e))) => Err(e),
            // Sender dropped without a verdict: the token's queues were
            // torn down.
            Ok(Err(_)) => Err(AcquireError::Terminated),
            Err(_) => Err(AcquireError::Deadline),
        }
    }

    /// Takes an idle worker for `token`, waiting until `deadline`.
    ///
    /// FIFO per token: if A calls before B, A is fulfilled first.
    /// Convenience over [`WorkerPool::enqueue`] + [`WorkerPool::redeem`]
    /// for callers without a separate admission step.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] when the token is unknown, terminated,
    /// unhealthy with no idle worker, or the deadline expires.
    pub async fn acquire(
        &self,
        token: &CodeToken,
        deadline: Instant,
    ) -> Result<ActiveWorker, AcquireError> {
        let ticket = self.enqueue(token)?;
        self.redeem(ticket, token, deadline).await
    }

    /// Returns a checked-out worker.
    pub fn release(&self, worker: ActiveWorker, outcome: ReleaseOutcome) {
        let mut guard = self.lock();
        let state = &mut *guard;
        match outcome {
            ReleaseOutcome::Clean => {
                let Some(queues) = state.queues.get_mut(&worker.code_token) else {
                    // Token deleted while the worker was busy; let the
                    // transport drop.
                    state.states.remove(&worker.execution_token);
                    return;
                };
                let mut idle = IdleWorker {
                    execution_token: worker.execution_token,
                    channel: worker.channel,
                };
                while let Some(waiter) = queues.waiters.pop_front() {
                    match waiter.send(Ok(idle)) {
                        Ok(()) => return,
                        Err(Ok(returned)) => idle = returned,
                        Err(Err(_)) => unreachable!("waiters only ever receive Ok here"),
                    }
                }
                state
                    .states
                    .insert(idle.execution_token.clone(), WorkerState::Idle);
                queues.idle.push_back(idle);
            }
            ReleaseOutcome::Retire | ReleaseOutcome::Faulted => {
                state.states.remove(&worker.execution_token);
                // Dropping `worker.channel` closes the socket; the runner
                // reaps the exit and respawns against the same token.
            }
        }
    }

    /// Tears down every worker and waiter for `token`.
    pub fn terminate(&self, token: &CodeToken) {
        let mut state = self.lock();
        let Some(mut queues) = state.queues.remove(token) else {
            return;
        };
        // Dropping each idle channel closes the socket; the worker sees
        // EOF and exits while the runner tears the entry down.
        for worker in queues.idle.drain(..) {
            state.states.remove(&worker.execution_token);
        }
        for waiter in queues.waiters.drain(..) {
            let _ = waiter.send(Err(AcquireError::Terminated));
        }
    }

    /// Marks a token unhealthy: pending waiters fail now, and future
    /// acquires fail once the remaining idle workers are gone.
    pub fn mark_unhealthy(&self, token: &CodeToken) {
        let mut state = self.lock();
        let Some(queues) = state.queues.get_mut(token) else {
            return;
        };
        queues.unhealthy = true;
        if queues.idle.is_empty() {
            for waiter in queues.waiters.drain(..) {
                let _ = waiter.send(Err(AcquireError::Unhealthy));
            }
        }
    }

    /// Idle workers currently queued for `token`.
    #[must_use]
    pub fn idle_count(&self, token: &CodeToken) -> usize {
        self.lock().queues.get(token).map_or(0, |q| q.idle.len())
    }

    /// Acquirers currently parked on `token`.
    #[must_use]
    pub fn waiter_count(&self, token: &CodeToken) -> usize {
        self.lock().queues.get(token).map_or(0, |q| q.waiters.len())
    }

    /// Target worker count registered for `token`, if known.
    #[must_use]
    pub fn target_workers(&self, token: &CodeToken) -> Option<usize> {
        self.lock().queues.get(token).map(|q| q.target_workers)
    }

    /// Current state of one worker, if tracked.
    #[must_use]
    pub fn worker_state(&self, token: &ExecutionToken) -> Option<WorkerState> {
        self.lock().states.get(token).copied()
    }
}

/// Accepts worker connections on the rendezvous socket.
///
/// Each worker's hello is two raw 36-byte tokens (code token, then
/// execution token) with no framing. Valid workers join the pool and are
/// announced on `events`; invalid hellos are logged and dropped.
///
/// Runs until the listener errors or `events` closes.
pub async fn run_acceptor(
    listener: UnixListener,
    pool: Arc<WorkerPool>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "rendezvous accept failed; acceptor exiting");
                return;
            }
        };
        let pool = Arc::clone(&pool);
        let spawned_events = events.clone();
        tokio::spawn(async move {
            match read_hello(stream).await {
                Ok((code_token, execution_token, stream)) => {
                    if !pool.add_worker(&code_token, execution_token.clone(), stream) {
                        debug!(%code_token, "worker presented unrecognised code token");
                        return;
                    }
                    let _ = spawned_events.send(HostEvent::WorkerConnected {
                        code_token,
                        execution_token,
                    });
                }
                Err(e) => debug!(error = %e, "malformed worker hello"),
            }
        });
        if events.is_closed() {
            return;
        }
    }
}

async fn read_hello(
    mut stream: UnixStream,
) -> std::io::Result<(CodeToken, ExecutionToken, UnixStream)> {
    let mut hello = [0u8; TOKEN_LEN * 2];
    stream.read_exact(&mut hello).await?;
    let code_token = CodeToken::from_wire(&hello[..TOKEN_LEN])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let execution_token = ExecutionToken::from_wire(&hello[TOKEN_LEN..])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok((code_token, execution_token, stream))
}
