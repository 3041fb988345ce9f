//! Events flowing into the dispatcher's aggregation task.
//!
//! Two producers feed one consumer: the rendezvous acceptor reports
//! worker arrivals, and the control client forwards runner-side spawn
//! outcomes. The dispatcher folds both into pending-load aggregation and
//! entry health.

use kiln_core::{CodeToken, ExecutionToken};

/// One host-side observation about a worker or entry.
#[derive(Debug)]
pub enum HostEvent {
    /// A worker presented a valid hello on the rendezvous socket and
    /// joined the pool.
    WorkerConnected {
        /// Entry the worker serves.
        code_token: CodeToken,
        /// The worker's own identity.
        execution_token: ExecutionToken,
    },

    /// The runner gave up spawning one worker for an entry.
    SpawnFailed {
        /// Entry the spawn was for.
        code_token: CodeToken,
        /// Failure detail from the runner.
        message: String,
    },

    /// The runner exhausted the startup respawn cap for an entry.
    EntryUnhealthy {
        /// The affected entry.
        code_token: CodeToken,
    },
}
