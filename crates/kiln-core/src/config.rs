//! Service configuration.
//!
//! One [`ServiceConfig`] is built by the embedding process (deserialized
//! or constructed in code) and handed to the host service at startup;
//! components receive references, never re-read globals. All durations
//! serialize as humantime strings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RespawnPolicy;
use crate::framing::MAX_FRAME_LEN;
use crate::padded::DEFAULT_MIN_FRAME_LEN;

/// Top-level configuration for the host service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Workers brought up per loaded entry when the caller does not say.
    #[serde(default = "default_worker_count")]
    pub default_worker_count: usize,

    /// Per-worker admission depth: a token admits at most
    /// `worker_count * worker_queue_cap` non-terminal executes.
    #[serde(default = "default_worker_queue_cap")]
    pub worker_queue_cap: usize,

    /// Execute deadline when the request carries no timeout tag.
    #[serde(default = "default_execute_timeout")]
    #[serde(with = "humantime_serde")]
    pub default_execute_timeout: Duration,

    /// Upper bound on serialized tenant metadata per request.
    #[serde(default = "default_max_metadata_bytes")]
    pub max_metadata_bytes: usize,

    /// Maximum control/worker frame payload; clamped by the protocol
    /// ceiling.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Lower clamp on padded payload frames.
    #[serde(default = "default_padded_min_frame_len")]
    pub padded_min_frame_len: usize,

    /// Directory holding the control and rendezvous sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Directory for per-execution log files (egress-enabled entries).
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Path of the worker-runner binary the host spawns at startup.
    #[serde(default = "default_runner_binary")]
    pub runner_binary: PathBuf,

    /// Root under which the runner creates its process-unique program
    /// directory.
    #[serde(default = "default_prog_dir_root")]
    pub prog_dir_root: PathBuf,

    /// Host paths bind-mounted read-only into each worker's view.
    #[serde(default = "default_mounts")]
    pub mounts: Vec<PathBuf>,

    /// Engine shim binary for the JavaScript/wasm loader kinds; `None`
    /// rejects those kinds at load.
    #[serde(default)]
    pub engine_shim: Option<PathBuf>,

    /// `RLIMIT_AS` ceiling applied to each worker; `None` leaves the
    /// inherited limit.
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,

    /// Startup-phase respawn policy.
    #[serde(default)]
    pub respawn: RespawnPolicy,

    /// How long an execute waits for an idle worker before its own
    /// deadline applies; the smaller of the two wins.
    #[serde(default = "default_acquire_timeout")]
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get)
}

const fn default_worker_queue_cap() -> usize {
    100
}

const fn default_execute_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_metadata_bytes() -> usize {
    64 * 1024
}

const fn default_max_frame_len() -> usize {
    MAX_FRAME_LEN
}

const fn default_padded_min_frame_len() -> usize {
    DEFAULT_MIN_FRAME_LEN
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/kiln/sock")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/kiln/log")
}

fn default_runner_binary() -> PathBuf {
    PathBuf::from("kiln-worker")
}

fn default_prog_dir_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_mounts() -> Vec<PathBuf> {
    vec![PathBuf::from("/lib"), PathBuf::from("/lib64")]
}

const fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_worker_count: default_worker_count(),
            worker_queue_cap: default_worker_queue_cap(),
            default_execute_timeout: default_execute_timeout(),
            max_metadata_bytes: default_max_metadata_bytes(),
            max_frame_len: default_max_frame_len(),
            padded_min_frame_len: default_padded_min_frame_len(),
            socket_dir: default_socket_dir(),
            log_dir: default_log_dir(),
            runner_binary: default_runner_binary(),
            prog_dir_root: default_prog_dir_root(),
            mounts: default_mounts(),
            engine_shim: None,
            memory_limit_bytes: None,
            respawn: RespawnPolicy::default(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl ServiceConfig {
    /// Path of the host↔runner control socket.
    #[must_use]
    pub fn control_socket_path(&self) -> PathBuf {
        self.socket_dir.join("control.sock")
    }

    /// Path of the worker rendezvous socket.
    #[must_use]
    pub fn rendezvous_socket_path(&self) -> PathBuf {
        self.socket_dir.join("udf.sock")
    }

    /// Admission ceiling for a token with `worker_count` workers.
    #[must_use]
    pub const fn admission_cap(&self, worker_count: usize) -> usize {
        worker_count * self.worker_queue_cap
    }

    /// Codec for padded tenant-payload frames, clamped per this config.
    #[must_use]
    pub fn padded_codec(&self) -> crate::padded::PaddedCodec {
        crate::padded::PaddedCodec::new(self.padded_min_frame_len, self.max_frame_len)
    }
}

pub(crate) mod humantime_serde {
    //! Durations as humantime strings ("1s 500ms") in serde.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
