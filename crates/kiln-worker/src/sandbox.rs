//! Worker sandboxing: the fork + pivot-root + bind-mount sequence.
//!
//! Each worker is spawned into a freshly unshared mount namespace and
//! pivoted into a scratch directory that mirrors only the configured
//! bind mounts (plus the program directory holding its binary), all
//! remounted read-only. The child performs, in order:
//!
//! 1. connect to the rendezvous socket; write the 36-byte code token and
//!    the 36-byte execution token
//! 2. unshare mount/IPC/UTS namespaces; mark the root mount private
//! 3. bind each configured mount source onto its mirror in the scratch
//!    directory
//! 4. bind the scratch directory over itself (recursive), then slave it
//! 5. pivot-root into the scratch directory (the `pivot/` hand-off
//!    directory was created by the parent)
//! 6. chdir to `/`; detach the old root; remount every bound mount and
//!    the binary's own directory read-only
//! 7. drop ambient capabilities and forbid privilege gains; apply the
//!    memory ceiling; park the socket on fd 3 and exec the binary with
//!    `"3"` as its sole leading argument
//!
//! Any step failing exits the child non-zero; the supervisor respawns
//! from the cached binary. Everything that allocates (paths, addresses,
//! the hello bytes) is prepared in the parent; the child only makes
//! syscalls.

use std::ffi::OsString;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use kiln_core::TOKEN_LEN;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};
use nix::unistd::{chdir, dup2, pivot_root};

use crate::cache::StagedEntry;

/// Fixed descriptor number the exec'd binary finds its socket on.
const WORKER_FD: i32 = 3;

/// Name of the old-root hand-off directory inside the scratch dir.
const PIVOT_DIR: &str = "pivot";

/// Spawn failures observed by the parent. Failures inside the child
/// surface as a non-zero exit instead.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Scratch or mirror directory setup failed.
    #[error("scratch setup: {0}")]
    Scratch(std::io::Error),

    /// The rendezvous path does not fit a socket address.
    #[error("rendezvous address: {0}")]
    Address(nix::Error),

    /// The log file could not be created.
    #[error("log file: {0}")]
    LogFile(std::io::Error),

    /// fork/exec failed.
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
}

/// Everything one spawn needs, borrowed from the runner's state.
pub struct SpawnOptions<'a> {
    /// Staged payload to execute.
    pub staged: &'a StagedEntry,
    /// Token the worker announces at rendezvous.
    pub code_token: &'a str,
    /// This worker's own identity (also names its log file).
    pub execution_token: &'a str,
    /// Host rendezvous socket path.
    pub rendezvous: &'a Path,
    /// Mount sources mirrored into the worker's view; must include the
    /// program directory.
    pub mounts: &'a [PathBuf],
    /// Where scratch directories are created.
    pub scratch_base: &'a Path,
    /// Per-execution log directory (egress entries only).
    pub log_dir: &'a Path,
    /// Optional `RLIMIT_AS` ceiling.
    pub memory_limit_bytes: Option<u64>,
}

/// A spawned worker and the scratch directory pivoted under it.
pub struct WorkerLaunch {
    /// The child process. The supervisor reaps it via `waitpid`; the
    /// handle is only kept for its pid.
    pub child: Child,
    /// Scratch directory to recycle once the worker is reaped.
    pub scratch_dir: PathBuf,
}

/// Spawns one sandboxed worker.
///
/// # Errors
///
/// Returns [`SandboxError`] for parent-side failures. The scratch
/// directory is recycled on error.
pub fn spawn_worker(opts: &SpawnOptions<'_>) -> Result<WorkerLaunch, SandboxError> {
    let scratch_dir = prepare_scratch(opts).map_err(SandboxError::Scratch)?;
    match spawn_into(opts, &scratch_dir) {
        Ok(child) => Ok(WorkerLaunch { child, scratch_dir }),
        Err(e) => {
            let _ = std::fs::remove_dir_all(&scratch_dir);
            Err(e)
        }
    }
}

/// Creates the scratch directory with mirror targets and the pivot
/// hand-off directory, so the child never has to create directories.
fn prepare_scratch(opts: &SpawnOptions<'_>) -> std::io::Result<PathBuf> {
    let scratch = tempfile::Builder::new()
        .prefix("kiln-worker-")
        .tempdir_in(opts.scratch_base)?
        .into_path();
    for source in opts.mounts {
        std::fs::create_dir_all(mirror_target(&scratch, source))?;
    }
    std::fs::create_dir_all(scratch.join(PIVOT_DIR))?;
    Ok(scratch)
}

/// Mirror of an absolute mount source inside the scratch directory.
fn mirror_target(scratch: &Path, source: &Path) -> PathBuf {
    match source.strip_prefix("/") {
        Ok(relative) => scratch.join(relative),
        Err(_) => scratch.join(source),
    }
}

fn spawn_into(opts: &SpawnOptions<'_>, scratch: &Path) -> Result<Child, SandboxError> {
    let address = UnixAddr::new(opts.rendezvous).map_err(SandboxError::Address)?;
    let mut hello = [0u8; TOKEN_LEN * 2];
    hello[..TOKEN_LEN].copy_from_slice(opts.code_token.as_bytes());
    hello[TOKEN_LEN..].copy_from_slice(opts.execution_token.as_bytes());

    let binds: Vec<(PathBuf, PathBuf)> = opts
        .mounts
        .iter()
        .map(|source| (source.clone(), mirror_target(scratch, source)))
        .collect();
    let remounts: Vec<PathBuf> = opts.mounts.to_vec();
    let scratch = scratch.to_path_buf();
    let pivot = scratch.join(PIVOT_DIR);
    let binary_dir = opts.staged.entry_dir.clone();
    let memory_limit = opts.memory_limit_bytes;

    let mut command = Command::new(&opts.staged.exec_path);
    command
        .arg(WORKER_FD.to_string())
        .args(&opts.staged.args_tail)
        .env_clear()
        .env("LD_LIBRARY_PATH", "/lib:/lib64")
        .stdin(Stdio::null());
    if opts.staged.log_egress {
        let log_path = opts
            .log_dir
            .join(format!("{}.log", opts.execution_token));
        let log_file = std::fs::File::create(&log_path).map_err(SandboxError::LogFile)?;
        let log_clone = log_file.try_clone().map_err(SandboxError::LogFile)?;
        command.stdout(log_file).stderr(log_clone);
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    // Safety: the closure runs between fork and exec. It only performs
    // syscalls on data prepared above; nothing allocates.
    unsafe {
        command.pre_exec(move || {
            // 1. Rendezvous hello.
            let sock = socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::empty(),
                None,
            )
            .map_err(errno)?;
            connect(sock.as_raw_fd(), &address).map_err(errno)?;
            let mut written = 0;
            while written < hello.len() {
                written += nix::unistd::write(&sock, &hello[written..]).map_err(errno)?;
            }

            // 2. New namespaces; non-propagating root.
            unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS)
                .map_err(errno)?;
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )
            .map_err(errno)?;

            // 3. Mirror the configured mounts.
            for (source, target) in &binds {
                mount(
                    Some(source),
                    target,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(errno)?;
            }

            // 4. Make the scratch dir a mount point and stop propagation
            // back out.
            mount(
                Some(&scratch),
                &scratch,
                Some("bind"),
                MsFlags::MS_REC | MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(errno)?;
            mount(
                None::<&str>,
                &scratch,
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_SLAVE,
                None::<&str>,
            )
            .map_err(errno)?;

            // 5. Swap roots.
            pivot_root(&scratch, &pivot).map_err(errno)?;

            // 6. Detach the old root; lock the view down.
            chdir("/").map_err(errno)?;
            umount2("/pivot", MntFlags::MNT_DETACH).map_err(errno)?;
            for source in &remounts {
                remount_read_only(source)?;
            }
            bind_read_only(&binary_dir)?;

            // 7. Guardrails, then hand the socket to the binary.
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(limit) = memory_limit {
                nix::sys::resource::setrlimit(
                    nix::sys::resource::Resource::RLIMIT_AS,
                    limit,
                    limit,
                )
                .map_err(errno)?;
            }
            let raw = sock.as_raw_fd();
            if raw != WORKER_FD {
                dup2(raw, WORKER_FD).map_err(errno)?;
                // `sock` drops at exec; WORKER_FD carries no CLOEXEC.
            }
            std::mem::forget(sock);
            Ok(())
        });
    }

    command.spawn().map_err(SandboxError::Spawn)
}

/// Remounts an existing bind mount read-only in place.
fn remount_read_only(target: &Path) -> std::io::Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(errno)
}

/// Binds a directory over itself and remounts it read-only; used for the
/// binary's containing directory, which is not itself a mount point.
fn bind_read_only(target: &Path) -> std::io::Result<()> {
    mount(
        Some(target),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(errno)?;
    remount_read_only(target)
}

fn errno(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Builds the full worker argv for diagnostics.
#[must_use]
pub fn describe_argv(staged: &StagedEntry) -> Vec<OsString> {
    let mut argv = vec![staged.exec_path.clone().into_os_string()];
    argv.push(OsString::from(WORKER_FD.to_string()));
    argv.extend(staged.args_tail.iter().cloned());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_target_strips_leading_slash() {
        let scratch = Path::new("/tmp/scratch");
        assert_eq!(
            mirror_target(scratch, Path::new("/lib64")),
            Path::new("/tmp/scratch/lib64")
        );
        assert_eq!(
            mirror_target(scratch, Path::new("/usr/lib")),
            Path::new("/tmp/scratch/usr/lib")
        );
    }

    #[test]
    fn prepare_scratch_builds_mirrors_and_pivot() {
        let base = tempfile::tempdir().unwrap();
        let staged = StagedEntry {
            entry_dir: base.path().join("entry"),
            exec_path: base.path().join("entry/udf"),
            args_tail: Vec::new(),
            log_egress: false,
        };
        let mounts = vec![PathBuf::from("/lib64"), base.path().join("prog")];
        let opts = SpawnOptions {
            staged: &staged,
            code_token: "c",
            execution_token: "e",
            rendezvous: Path::new("/tmp/udf.sock"),
            mounts: &mounts,
            scratch_base: base.path(),
            log_dir: base.path(),
            memory_limit_bytes: None,
        };
        let scratch = prepare_scratch(&opts).unwrap();
        assert!(scratch.join("lib64").is_dir());
        assert!(scratch.join(PIVOT_DIR).is_dir());
        assert!(mirror_target(&scratch, &mounts[1]).is_dir());
        std::fs::remove_dir_all(scratch).unwrap();
    }

    #[test]
    fn argv_leads_with_fixed_fd() {
        let staged = StagedEntry {
            entry_dir: PathBuf::from("/prog/tok"),
            exec_path: PathBuf::from("/prog/tok/udf"),
            args_tail: vec![OsString::from("/prog/tok/source.js")],
            log_egress: false,
        };
        let argv = describe_argv(&staged);
        assert_eq!(argv[1], OsString::from("3"));
        assert_eq!(argv.len(), 3);
    }
}
