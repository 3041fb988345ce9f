//! kiln-worker: the worker runner.
//!
//! Spawned by the host at service start, this process owns everything
//! that must happen outside the host's async runtime: staging UDF
//! payloads, cloning sandboxed worker processes, reaping them, and
//! respawning crashed ones from the cached payload. It dials the host's
//! control socket at startup and then serves LoadBinary / DeleteBinary /
//! CancelExecution / Shutdown until the host closes the channel.
//!
//! The process is deliberately synchronous: it forks, and forking a
//! multi-threaded async runtime is undefined behaviour. The only threads
//! are the control loop (main) and the reaper.

mod cache;
mod sandbox;
mod supervise;

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kiln_core::backoff::RespawnPolicy;
use kiln_core::framing::read_frame;
use kiln_core::messages::WireMessage;
use kiln_core::MAX_FRAME_LEN;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::ProgramDir;
use crate::supervise::{RunnerConfig, Supervisor};

/// kiln worker runner: clones, sandboxes, and supervises UDF workers.
#[derive(Parser, Debug)]
#[command(name = "kiln-worker", version, about, long_about = None)]
struct Args {
    /// Host control socket to dial at startup.
    #[arg(long)]
    control_socket: PathBuf,

    /// Host rendezvous socket workers dial after cloning.
    #[arg(long)]
    udf_socket: PathBuf,

    /// Directory for per-execution log files.
    #[arg(long)]
    log_dir: PathBuf,

    /// Root under which the process-unique program directory is created.
    #[arg(long, default_value = "/tmp")]
    prog_dir_root: PathBuf,

    /// Comma-separated mount sources mirrored into every worker.
    #[arg(long, value_delimiter = ',', default_value = "/lib,/lib64")]
    mounts: Vec<PathBuf>,

    /// Startup-phase respawns allowed per entry.
    #[arg(long, default_value_t = 3)]
    retry_cap: u32,

    /// RLIMIT_AS ceiling applied to workers, in bytes.
    #[arg(long)]
    memory_limit_bytes: Option<u64>,

    /// Engine shim binary for JavaScript/wasm entries.
    #[arg(long)]
    engine_shim: Option<PathBuf>,

    /// Uptime after which a worker counts as successfully started.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    min_uptime: Duration,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.log_dir).context("create log dir")?;
    let prog = ProgramDir::create(&args.prog_dir_root, args.engine_shim.clone())
        .context("create program dir")?;
    info!(prog_dir = %prog.root().display(), "runner starting");

    let control = UnixStream::connect(&args.control_socket)
        .with_context(|| format!("dial control socket {}", args.control_socket.display()))?;
    let control_writer = control.try_clone().context("clone control stream")?;

    let supervisor = Supervisor::new(
        RunnerConfig {
            rendezvous: args.udf_socket,
            log_dir: args.log_dir,
            mounts: args.mounts,
            scratch_base: std::env::temp_dir(),
            memory_limit_bytes: args.memory_limit_bytes,
            respawn: RespawnPolicy {
                retry_cap: args.retry_cap,
                ..RespawnPolicy::default()
            },
            min_uptime: args.min_uptime,
            max_frame_len: MAX_FRAME_LEN,
        },
        prog,
        control_writer,
    );

    let reaper = std::thread::Builder::new()
        .name("reaper".to_owned())
        .spawn({
            let supervisor = supervisor.clone();
            move || supervisor.reaper_loop()
        })
        .context("spawn reaper thread")?;

    run_control_loop(control, &supervisor);

    supervisor.begin_shutdown();
    if reaper.join().is_err() {
        warn!("reaper thread panicked");
    }
    supervisor.cleanup_program_dir();
    info!("runner exiting");
    Ok(())
}

/// Serves control requests until the host closes the channel or asks
/// for shutdown.
fn run_control_loop(mut control: UnixStream, supervisor: &Supervisor) {
    loop {
        let frame = match read_frame(&mut control, MAX_FRAME_LEN) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("host closed control channel");
                return;
            }
            Err(e) => {
                warn!(error = %e, "control read failed");
                return;
            }
        };
        let message = match WireMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable control frame");
                return;
            }
        };
        match message {
            WireMessage::LoadBinary(load) => {
                let result = supervisor.handle_load(&load);
                supervisor.send_ack(load.request_id, result);
            }
            WireMessage::DeleteBinary(delete) => {
                supervisor.handle_delete(&delete.code_token);
                supervisor.send_ack(delete.request_id, Ok(()));
            }
            WireMessage::CancelExecution(cancel) => {
                supervisor.handle_cancel(&cancel.execution_token);
                supervisor.send_ack(cancel.request_id, Ok(()));
            }
            WireMessage::Shutdown(shutdown) => {
                supervisor.send_ack(shutdown.request_id, Ok(()));
                return;
            }
            other => warn!(?other, "unexpected message on control channel"),
        }
    }
}
