//! Worker supervision: the control loop's muscle and the reaper.
//!
//! The supervisor owns the runner's mutable state (staged entries, live
//! workers, respawn streaks) behind one mutex, never held across a
//! blocking syscall. The reaper thread waits on any child exit and
//! decides between recycle-and-respawn (entry still cached) and plain
//! cleanup (entry deleted). Workers that keep dying before reaching
//! rendezvous burn through the respawn policy and mark their entry
//! unhealthy on the control channel.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use kiln_core::backoff::{RespawnPolicy, RespawnTracker};
use kiln_core::framing::write_frame;
use kiln_core::messages::{Ack, EntryUnhealthy, LoadBinary, SpawnFailed, WireMessage};
use kiln_core::ExecutionToken;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::cache::ProgramDir;
use crate::sandbox::{SandboxError, SpawnOptions, spawn_worker};

/// Runner-side configuration, assembled from flags in `main`.
pub struct RunnerConfig {
    /// Host rendezvous socket workers dial.
    pub rendezvous: PathBuf,
    /// Per-execution log directory.
    pub log_dir: PathBuf,
    /// Mount sources mirrored into workers (the program directory is
    /// appended at startup).
    pub mounts: Vec<PathBuf>,
    /// Where worker scratch directories live.
    pub scratch_base: PathBuf,
    /// Optional `RLIMIT_AS` for workers.
    pub memory_limit_bytes: Option<u64>,
    /// Startup respawn policy.
    pub respawn: RespawnPolicy,
    /// A worker living at least this long counts as having started
    /// successfully, resetting its token's failure streak.
    pub min_uptime: Duration,
    /// Frame ceiling on the control channel.
    pub max_frame_len: usize,
}

struct WorkerRecord {
    code_token: String,
    execution_token: String,
    scratch_dir: PathBuf,
    spawned_at: Instant,
}

struct SupervisorState {
    prog: ProgramDir,
    workers: HashMap<i32, WorkerRecord>,
    exec_index: HashMap<String, i32>,
    trackers: HashMap<String, RespawnTracker>,
    shutdown: bool,
}

/// The runner's shared core: control handlers on one side, the reaper on
/// the other.
pub struct Supervisor {
    config: RunnerConfig,
    state: Mutex<SupervisorState>,
    reaper_wakeup: Condvar,
    control_writer: Mutex<UnixStream>,
}

impl Supervisor {
    /// Builds the supervisor around a created program directory and the
    /// write half of the control stream.
    pub fn new(config: RunnerConfig, prog: ProgramDir, control_writer: UnixStream) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(SupervisorState {
                prog,
                workers: HashMap::new(),
                exec_index: HashMap::new(),
                trackers: HashMap::new(),
                shutdown: false,
            }),
            reaper_wakeup: Condvar::new(),
            control_writer: Mutex::new(control_writer),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stages a load and clones its workers. The ack reports staging;
    /// per-worker outcomes reach the host as rendezvous connects or
    /// spawn-failed events.
    pub fn handle_load(&self, load: &LoadBinary) -> Result<(), String> {
        {
            let mut state = self.lock();
            state.prog.stage(load).map_err(|e| e.to_string())?;
        }
        info!(token = %load.code_token, n_workers = load.n_workers, "staged entry");
        for _ in 0..load.n_workers {
            if let Err(e) = self.spawn_one(&load.code_token) {
                warn!(token = %load.code_token, error = %e, "load-phase spawn failed");
                self.send(WireMessage::SpawnFailed(SpawnFailed {
                    code_token: load.code_token.clone(),
                    message: e.to_string(),
                }));
            }
        }
        Ok(())
    }

    /// Forgets an entry, removes its staged files, and kills its
    /// workers. The reaper recycles their scratch directories.
    pub fn handle_delete(&self, code_token: &str) {
        let pids: Vec<i32> = {
            let mut state = self.lock();
            state.prog.remove(code_token);
            state.trackers.remove(code_token);
            state
                .workers
                .iter()
                .filter(|(_, record)| record.code_token == code_token)
                .map(|(pid, _)| *pid)
                .collect()
        };
        info!(token = %code_token, workers = pids.len(), "deleting entry");
        for pid in pids {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(pid, error = %e, "kill during delete");
            }
        }
    }

    /// Kills the worker currently identified by an execution token.
    /// Quiet when the token is unknown (the worker may have finished).
    pub fn handle_cancel(&self, execution_token: &str) {
        let pid = self.lock().exec_index.get(execution_token).copied();
        match pid {
            Some(pid) => {
                info!(%execution_token, pid, "cancelling worker");
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    debug!(pid, error = %e, "kill during cancel");
                }
            }
            None => debug!(%execution_token, "cancel for unknown execution token"),
        }
    }

    /// Flags shutdown, kills every worker, and wakes the reaper so it
    /// can drain and exit.
    pub fn begin_shutdown(&self) {
        let pids: Vec<i32> = {
            let mut state = self.lock();
            state.shutdown = true;
            state.workers.keys().copied().collect()
        };
        info!(workers = pids.len(), "runner shutting down");
        for pid in pids {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        self.reaper_wakeup.notify_all();
    }

    /// Removes the program directory; call after the reaper drained.
    pub fn cleanup_program_dir(&self) {
        let root = self.lock().prog.root().to_path_buf();
        if let Err(e) = std::fs::remove_dir_all(&root) {
            warn!(dir = %root.display(), error = %e, "program dir cleanup failed");
        }
    }

    /// Acks one control request.
    pub fn send_ack(&self, request_id: u64, result: Result<(), String>) {
        let (ok, message) = match result {
            Ok(()) => (true, String::new()),
            Err(message) => (false, message),
        };
        self.send(WireMessage::Ack(Ack {
            request_id,
            ok,
            message,
        }));
    }

    fn send(&self, message: WireMessage) {
        let mut writer = self
            .control_writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = write_frame(&mut *writer, &message.encode(), self.config.max_frame_len) {
            warn!(error = %e, "control write failed");
        }
    }

    /// Clones one worker for a staged entry and records it.
    fn spawn_one(&self, code_token: &str) -> Result<(), SandboxError> {
        let (staged, mounts) = {
            let state = self.lock();
            let staged = state.prog.get(code_token).ok_or_else(|| {
                SandboxError::Spawn(std::io::Error::other("entry no longer staged"))
            })?;
            (staged.clone(), self.mounts_with_prog(&state))
        };
        let execution_token = ExecutionToken::generate();
        let launch = spawn_worker(&SpawnOptions {
            staged: &staged,
            code_token,
            execution_token: execution_token.as_str(),
            rendezvous: &self.config.rendezvous,
            mounts: &mounts,
            scratch_base: &self.config.scratch_base,
            log_dir: &self.config.log_dir,
            memory_limit_bytes: self.config.memory_limit_bytes,
        })?;
        #[allow(clippy::cast_possible_wrap)] // pids fit in i32
        let pid = launch.child.id() as i32;
        debug!(
            token = %code_token,
            %execution_token,
            pid,
            argv = ?crate::sandbox::describe_argv(&staged),
            "worker spawned"
        );
        let mut state = self.lock();
        state.workers.insert(
            pid,
            WorkerRecord {
                code_token: code_token.to_owned(),
                execution_token: execution_token.to_string(),
                scratch_dir: launch.scratch_dir,
                spawned_at: Instant::now(),
            },
        );
        state
            .exec_index
            .insert(execution_token.to_string(), pid);
        drop(state);
        self.reaper_wakeup.notify_all();
        Ok(())
    }

    fn mounts_with_prog(&self, state: &SupervisorState) -> Vec<PathBuf> {
        let mut mounts = self.config.mounts.clone();
        mounts.push(state.prog.root().to_path_buf());
        mounts
    }

    /// The reaper: waits on any child exit, recycles the pivoted scratch
    /// directory, and respawns for entries that still exist. Runs until
    /// shutdown has drained every worker.
    pub fn reaper_loop(&self) {
        loop {
            {
                let mut state = self.lock();
                while state.workers.is_empty() && !state.shutdown {
                    state = self
                        .reaper_wakeup
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                if state.shutdown && state.workers.is_empty() {
                    return;
                }
            }
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.on_reaped(pid.as_raw(), code == 0);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    debug!(pid = pid.as_raw(), %signal, "worker killed by signal");
                    self.on_reaped(pid.as_raw(), false);
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    // Records exist but no child does; reconcile by
                    // dropping stale records.
                    let mut state = self.lock();
                    for (_, record) in state.workers.drain() {
                        let _ = std::fs::remove_dir_all(&record.scratch_dir);
                    }
                    state.exec_index.clear();
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn on_reaped(&self, pid: i32, clean_exit: bool) {
        let record = {
            let mut state = self.lock();
            let Some(record) = state.workers.remove(&pid) else {
                debug!(pid, "reaped unknown pid");
                return;
            };
            state.exec_index.remove(&record.execution_token);
            record
        };
        if let Err(e) = std::fs::remove_dir_all(&record.scratch_dir) {
            warn!(dir = %record.scratch_dir.display(), error = %e, "scratch cleanup failed");
        }

        let (still_cached, shutdown) = {
            let state = self.lock();
            (
                state.prog.get(&record.code_token).is_some(),
                state.shutdown,
            )
        };
        if shutdown || !still_cached {
            return;
        }

        let healthy = clean_exit || record.spawned_at.elapsed() >= self.config.min_uptime;
        if healthy {
            self.lock()
                .trackers
                .entry(record.code_token.clone())
                .or_default()
                .record_success();
            self.respawn(&record.code_token);
        } else {
            self.respawn_after_failure(&record.code_token, "worker died during startup");
        }
    }

    /// Respawns immediately; spawn errors fall into the failure path.
    fn respawn(&self, code_token: &str) {
        if let Err(e) = self.spawn_one(code_token) {
            self.respawn_after_failure(code_token, &e.to_string());
        }
    }

    /// Applies the respawn policy after a startup failure: wait and try
    /// again, or declare the entry unhealthy once the cap is spent.
    fn respawn_after_failure(&self, code_token: &str, reason: &str) {
        loop {
            let delay = {
                let mut state = self.lock();
                state
                    .trackers
                    .entry(code_token.to_owned())
                    .or_default()
                    .record_failure(&self.config.respawn)
            };
            let Some(delay) = delay else {
                warn!(token = %code_token, %reason, "startup respawn cap exhausted");
                self.send(WireMessage::SpawnFailed(SpawnFailed {
                    code_token: code_token.to_owned(),
                    message: format!("startup respawn cap exhausted: {reason}"),
                }));
                self.send(WireMessage::EntryUnhealthy(EntryUnhealthy {
                    code_token: code_token.to_owned(),
                }));
                return;
            };
            std::thread::sleep(delay);
            {
                let state = self.lock();
                if state.shutdown || state.prog.get(code_token).is_none() {
                    return;
                }
            }
            match self.spawn_one(code_token) {
                Ok(()) => return,
                Err(e) => debug!(token = %code_token, error = %e, "respawn attempt failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::messages::LoaderKind;

    use super::*;

    fn supervisor(dir: &std::path::Path) -> (Arc<Supervisor>, UnixStream) {
        let (writer, host_end) = UnixStream::pair().unwrap();
        let prog = ProgramDir::create(dir, None).unwrap();
        let config = RunnerConfig {
            rendezvous: dir.join("udf.sock"),
            log_dir: dir.to_path_buf(),
            mounts: Vec::new(),
            scratch_base: dir.to_path_buf(),
            memory_limit_bytes: None,
            respawn: RespawnPolicy::default(),
            min_uptime: Duration::from_secs(1),
            max_frame_len: kiln_core::MAX_FRAME_LEN,
        };
        (Supervisor::new(config, prog, writer), host_end)
    }

    fn read_event(stream: &mut UnixStream) -> WireMessage {
        let frame = kiln_core::read_frame(stream, kiln_core::MAX_FRAME_LEN)
            .unwrap()
            .unwrap();
        WireMessage::decode(&frame).unwrap()
    }

    #[test]
    fn ack_reports_staging_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, mut host_end) = supervisor(dir.path());
        let load = LoadBinary {
            request_id: 9,
            code_token: "tok".to_owned(),
            binary_content: Vec::new(), // invalid: empty
            n_workers: 1,
            enable_log_egress: false,
            source_code_token: String::new(),
            loader_kind: LoaderKind::NativeBinary as i32,
            js_source: Vec::new(),
            wasm_blob: Vec::new(),
        };
        let result = supervisor.handle_load(&load);
        supervisor.send_ack(load.request_id, result);
        let WireMessage::Ack(ack) = read_event(&mut host_end) else {
            panic!("expected ack");
        };
        assert_eq!(ack.request_id, 9);
        assert!(!ack.ok);
        assert!(ack.message.contains("empty payload"));
    }

    #[test]
    fn load_phase_spawn_failure_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, mut host_end) = supervisor(dir.path());
        // Stages fine, but the "binary" is not executable and the
        // rendezvous socket does not exist, so the spawn fails either at
        // exec or inside the child; a load-phase clone error surfaces as
        // SpawnFailed. Use a directory as scratch_base that exists so
        // the failure comes from exec.
        let load = LoadBinary {
            request_id: 1,
            code_token: "11111111-1111-4111-8111-111111111111".to_owned(),
            binary_content: b"not an elf".to_vec(),
            n_workers: 1,
            enable_log_egress: false,
            source_code_token: String::new(),
            loader_kind: LoaderKind::NativeBinary as i32,
            js_source: Vec::new(),
            wasm_blob: Vec::new(),
        };
        let result = supervisor.handle_load(&load);
        // Staging itself succeeds.
        assert!(result.is_ok());
        // The spawn either failed synchronously (SpawnFailed event now)
        // or produced a child that dies in pre-exec and is reaped later;
        // both are valid. Only assert the synchronous case when it
        // happened.
        supervisor.send_ack(load.request_id, result);
        loop {
            match read_event(&mut host_end) {
                WireMessage::Ack(ack) => {
                    assert!(ack.ok);
                    break;
                }
                WireMessage::SpawnFailed(event) => {
                    assert_eq!(event.code_token, "11111111-1111-4111-8111-111111111111");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn reaping_a_dead_worker_recycles_its_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _host_end) = supervisor(dir.path());

        let scratch = dir.path().join("kiln-worker-test-scratch");
        std::fs::create_dir_all(scratch.join("pivot")).unwrap();
        std::fs::write(scratch.join("pivot").join("leftover"), b"x").unwrap();
        {
            let mut state = supervisor.lock();
            state.workers.insert(
                4242,
                WorkerRecord {
                    code_token: "tok-deleted".to_owned(),
                    execution_token: "exec-1".to_owned(),
                    scratch_dir: scratch.clone(),
                    spawned_at: Instant::now(),
                },
            );
            state.exec_index.insert("exec-1".to_owned(), 4242);
        }

        // The entry was never staged (already deleted), so the reap is
        // pure cleanup: scratch recycled, indices cleared, no respawn.
        supervisor.on_reaped(4242, false);

        assert!(!scratch.exists());
        let state = supervisor.lock();
        assert!(state.workers.is_empty());
        assert!(state.exec_index.is_empty());
    }

    #[test]
    fn reaping_an_unknown_pid_leaves_records_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _host_end) = supervisor(dir.path());

        let scratch = dir.path().join("live-scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        {
            let mut state = supervisor.lock();
            state.workers.insert(
                7,
                WorkerRecord {
                    code_token: "tok".to_owned(),
                    execution_token: "exec-7".to_owned(),
                    scratch_dir: scratch.clone(),
                    spawned_at: Instant::now(),
                },
            );
            state.exec_index.insert("exec-7".to_owned(), 7);
        }

        supervisor.on_reaped(9999, false);

        assert!(scratch.exists());
        let state = supervisor.lock();
        assert!(state.workers.contains_key(&7));
        assert!(state.exec_index.contains_key("exec-7"));
    }

    #[test]
    fn cancel_of_unknown_token_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _host_end) = supervisor(dir.path());
        supervisor.handle_cancel("no-such-token");
    }

    #[test]
    fn delete_of_unknown_token_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _host_end) = supervisor(dir.path());
        supervisor.handle_delete("no-such-token");
    }
}
