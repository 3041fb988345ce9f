//! Runner process handle and control-protocol client.
//!
//! The host cannot clone sandboxed children itself (forking a
//! multi-threaded tokio process is undefined behaviour), so all spawning
//! happens in the worker-runner binary. This module owns that process:
//! spawning it into its own process group, the framed control channel to
//! it, per-request ack correlation, and group teardown at shutdown.
//!
//! Control requests carry a monotonically increasing id; the runner
//! answers each with an [`Ack`] bearing the same id. Unsolicited
//! runner→host messages (spawn failures, health) are forwarded to the
//! dispatcher's event channel.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use kiln_core::framing::{FrameCodec, FrameError};
use kiln_core::messages::{
    Ack, CancelExecution, DeleteBinary, LoadBinary, Shutdown, WireMessage,
};
use kiln_core::{CodeToken, ExecutionToken, ServiceConfig};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::events::HostEvent;

/// Control-channel failures, surfaced to the dispatcher as `Internal`
/// unless noted on the method.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Frame-level failure writing to the runner.
    #[error("control transport: {0}")]
    Transport(#[from] FrameError),

    /// The runner process closed the control channel.
    #[error("runner is gone")]
    RunnerGone,

    /// The runner acked with a failure.
    #[error("runner rejected request: {0}")]
    Rejected(String),

    /// No ack arrived within the correlation timeout.
    #[error("runner ack timed out")]
    AckTimeout,
}

type ControlSink = SplitSink<Framed<UnixStream, FrameCodec>, Bytes>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Ack>>>>;

/// Client end of the host↔runner control channel.
pub struct ControlClient {
    sink: tokio::sync::Mutex<ControlSink>,
    pending: PendingAcks,
    next_id: AtomicU64,
    ack_timeout: Duration,
}

impl ControlClient {
    /// Default patience for acks; generous because a load ack waits for
    /// the runner to write the binary to disk.
    pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

    /// Wraps a connected control stream and starts the read task.
    ///
    /// Runner events are forwarded to `events`; acks resolve their
    /// pending requests.
    #[must_use]
    pub fn start(
        stream: UnixStream,
        max_frame_len: usize,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        let framed = Framed::new(stream, FrameCodec::with_max_frame_len(max_frame_len));
        let (sink, read) = framed.split();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(read_loop(read, Arc::clone(&pending), events));
        Self {
            sink: tokio::sync::Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(1),
            ack_timeout: Self::DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Stages a binary and brings up workers. `msg.request_id` is
    /// assigned here.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport failure or a rejecting ack.
    pub async fn load_binary(&self, msg: LoadBinary) -> Result<(), ControlError> {
        self.request(|id| WireMessage::LoadBinary(LoadBinary { request_id: id, ..msg }))
            .await
    }

    /// Tears down an entry's workers and staged payload.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport failure or a rejecting ack.
    pub async fn delete_binary(&self, token: &CodeToken) -> Result<(), ControlError> {
        self.request(|id| {
            WireMessage::DeleteBinary(DeleteBinary {
                request_id: id,
                code_token: token.to_string(),
            })
        })
        .await
    }

    /// Kills the worker currently identified by `execution_token`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport failure or a rejecting ack.
    pub async fn cancel_execution(&self, execution_token: &ExecutionToken) -> Result<(), ControlError> {
        self.request(|id| {
            WireMessage::CancelExecution(CancelExecution {
                request_id: id,
                execution_token: execution_token.to_string(),
            })
        })
        .await
    }

    /// Asks the runner to drain and exit.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport failure or a rejecting ack.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.request(|id| WireMessage::Shutdown(Shutdown { request_id: id }))
            .await
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> WireMessage,
    ) -> Result<(), ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, tx);

        let payload = Bytes::from(build(id).encode());
        let send_result = {
            let mut sink = self.sink.lock().await;
            sink.send(payload).await
        };
        if let Err(e) = send_result {
            self.forget(id);
            return Err(e.into());
        }

        let ack = match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(ControlError::RunnerGone),
            Err(_) => {
                self.forget(id);
                return Err(ControlError::AckTimeout);
            }
        };
        if ack.ok {
            Ok(())
        } else {
            Err(ControlError::Rejected(ack.message))
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }
}

async fn read_loop(
    mut read: SplitStream<Framed<UnixStream, FrameCodec>>,
    pending: PendingAcks,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                break;
            }
        };
        match WireMessage::decode(&frame) {
            Ok(WireMessage::Ack(ack)) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&ack.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => debug!(id = ack.request_id, "ack for forgotten request"),
                }
            }
            Ok(WireMessage::SpawnFailed(msg)) => {
                let Ok(code_token) = CodeToken::parse(&msg.code_token) else {
                    warn!("spawn-failed event with malformed token");
                    continue;
                };
                let _ = events.send(HostEvent::SpawnFailed {
                    code_token,
                    message: msg.message,
                });
            }
            Ok(WireMessage::EntryUnhealthy(msg)) => {
                let Ok(code_token) = CodeToken::parse(&msg.code_token) else {
                    warn!("unhealthy event with malformed token");
                    continue;
                };
                let _ = events.send(HostEvent::EntryUnhealthy { code_token });
            }
            Ok(other) => warn!(?other, "unexpected message on control channel"),
            Err(e) => {
                warn!(error = %e, "undecodable control frame");
                break;
            }
        }
    }
    info!("control channel closed; failing pending requests");
    // Dropping the senders wakes every in-flight request with RunnerGone.
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clear();
}

/// The spawned runner process.
///
/// The runner is its own process-group leader so shutdown can sweep it
/// and every worker it cloned in one signal.
pub struct RunnerHandle {
    child: Child,
    pgid: Pid,
}

impl RunnerHandle {
    /// Spawns the runner binary with flags derived from `config`.
    ///
    /// # Errors
    ///
    /// Returns the spawn error, or an internal error if the child has no
    /// pid (it exited before we looked).
    pub fn spawn(config: &ServiceConfig) -> std::io::Result<Self> {
        let mounts = config
            .mounts
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut command = Command::new(&config.runner_binary);
        command
            .arg("--control-socket")
            .arg(config.control_socket_path())
            .arg("--udf-socket")
            .arg(config.rendezvous_socket_path())
            .arg("--log-dir")
            .arg(&config.log_dir)
            .arg("--prog-dir-root")
            .arg(&config.prog_dir_root)
            .arg("--mounts")
            .arg(mounts)
            .arg("--retry-cap")
            .arg(config.respawn.retry_cap.to_string())
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(limit) = config.memory_limit_bytes {
            command.arg("--memory-limit-bytes").arg(limit.to_string());
        }
        if let Some(shim) = &config.engine_shim {
            command.arg("--engine-shim").arg(shim);
        }
        let child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("runner exited before its pid could be read")
        })?;
        #[allow(clippy::cast_possible_wrap)] // pids fit in i32
        let pgid = Pid::from_raw(pid as i32);
        info!(%pgid, runner = %config.runner_binary.display(), "runner spawned");
        Ok(Self { child, pgid })
    }

    /// OS pid of the runner.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pgid
    }

    /// Terminates the runner's whole process group and reaps it.
    ///
    /// SIGTERM first; SIGKILL after `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Err(e) = killpg(self.pgid, Signal::SIGTERM) {
            debug!(error = %e, "killpg(SIGTERM) on runner group");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "runner exited");
                return;
            }
            Ok(Err(e)) => warn!(error = %e, "waiting on runner failed"),
            Err(_) => warn!("runner ignored SIGTERM; escalating"),
        }
        if let Err(e) = killpg(self.pgid, Signal::SIGKILL) {
            debug!(error = %e, "killpg(SIGKILL) on runner group");
        }
        let _ = self.child.wait().await;
    }
}

/// Connects the host side of the control channel: binds `control_path`,
/// spawns the runner, and waits for it to dial in.
///
/// # Errors
///
/// Returns an I/O error if the socket cannot be bound, the runner cannot
/// be spawned, or it does not connect within `accept_timeout`.
pub async fn bootstrap_runner(
    config: &ServiceConfig,
    accept_timeout: Duration,
) -> std::io::Result<(RunnerHandle, UnixStream)> {
    let control_path = config.control_socket_path();
    remove_stale_socket(&control_path)?;
    let listener = tokio::net::UnixListener::bind(&control_path)?;
    let runner = RunnerHandle::spawn(config)?;
    let accepted = tokio::time::timeout(accept_timeout, listener.accept()).await;
    // The rendezvous listener stays up for the service's lifetime; the
    // control listener accepts exactly one peer.
    drop(listener);
    match accepted {
        Ok(Ok((stream, _addr))) => Ok((runner, stream)),
        Ok(Err(e)) => {
            runner.shutdown(Duration::from_secs(1)).await;
            Err(e)
        }
        Err(_) => {
            runner.shutdown(Duration::from_secs(1)).await;
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "runner did not connect to the control socket",
            ))
        }
    }
}

pub(crate) fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::framing::read_frame;
    use kiln_core::messages::SpawnFailed;
    use kiln_core::write_frame;

    use super::*;

    async fn client_pair() -> (ControlClient, std::os::unix::net::UnixStream, mpsc::UnboundedReceiver<HostEvent>) {
        let (host_side, runner_side) = UnixStream::pair().unwrap();
        let runner_side = runner_side.into_std().unwrap();
        runner_side.set_nonblocking(false).unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = ControlClient::start(host_side, kiln_core::MAX_FRAME_LEN, events_tx);
        (client, runner_side, events_rx)
    }

    #[tokio::test]
    async fn request_resolves_on_ack() {
        let (client, runner_side, _events) = client_pair().await;
        let token = CodeToken::generate();

        let echo = tokio::task::spawn_blocking(move || {
            let mut stream = runner_side;
            let frame = read_frame(&mut stream, kiln_core::MAX_FRAME_LEN)
                .unwrap()
                .unwrap();
            let WireMessage::DeleteBinary(msg) = WireMessage::decode(&frame).unwrap() else {
                panic!("expected DeleteBinary");
            };
            let ack = WireMessage::Ack(Ack {
                request_id: msg.request_id,
                ok: true,
                message: String::new(),
            });
            write_frame(&mut stream, &ack.encode(), kiln_core::MAX_FRAME_LEN).unwrap();
            stream
        });

        client.delete_binary(&token).await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn rejecting_ack_surfaces_message() {
        let (client, runner_side, _events) = client_pair().await;
        let token = ExecutionToken::generate();

        let echo = tokio::task::spawn_blocking(move || {
            let mut stream = runner_side;
            let frame = read_frame(&mut stream, kiln_core::MAX_FRAME_LEN)
                .unwrap()
                .unwrap();
            let WireMessage::CancelExecution(msg) = WireMessage::decode(&frame).unwrap() else {
                panic!("expected CancelExecution");
            };
            let ack = WireMessage::Ack(Ack {
                request_id: msg.request_id,
                ok: false,
                message: "no such worker".to_owned(),
            });
            write_frame(&mut stream, &ack.encode(), kiln_core::MAX_FRAME_LEN).unwrap();
            stream
        });

        let err = client.cancel_execution(&token).await.unwrap_err();
        assert!(matches!(err, ControlError::Rejected(msg) if msg == "no such worker"));
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn runner_death_fails_pending_requests() {
        let (client, runner_side, _events) = client_pair().await;
        drop(runner_side);
        let err = client.shutdown().await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::RunnerGone | ControlError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn events_are_forwarded() {
        let (_client, runner_side, mut events) = client_pair().await;
        let token = CodeToken::generate();
        let msg = WireMessage::SpawnFailed(SpawnFailed {
            code_token: token.to_string(),
            message: "exec format error".to_owned(),
        });
        let mut stream = runner_side;
        tokio::task::spawn_blocking(move || {
            write_frame(&mut stream, &msg.encode(), kiln_core::MAX_FRAME_LEN).unwrap();
            stream
        })
        .await
        .unwrap();

        match events.recv().await.unwrap() {
            HostEvent::SpawnFailed {
                code_token,
                message,
            } => {
                assert_eq!(code_token, token);
                assert_eq!(message, "exec format error");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
