//! Service façade: wiring the host together.
//!
//! [`UdfService::start`] owns the process-scope setup the components
//! assume: socket and log directories, the ignored `SIGPIPE`, the
//! rendezvous listener, the runner child, and the background tasks. The
//! components themselves receive borrowed handles and never touch
//! globals; everything is torn down by [`UdfService::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use kiln_core::ServiceConfig;
use nix::sys::signal::{SigHandler, Signal, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::functions::FunctionRegistry;
use crate::pool::{WorkerPool, run_acceptor};
use crate::runner::{ControlClient, RunnerHandle, bootstrap_runner, remove_stale_socket};
use crate::sideband::Sideband;

/// Failures bringing the service up.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Directory, socket, or runner-spawn failure.
    #[error("service bootstrap: {0}")]
    Io(#[from] std::io::Error),
}

/// A running host service.
pub struct UdfService {
    dispatcher: Arc<Dispatcher>,
    runner: RunnerHandle,
    acceptor_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

impl UdfService {
    /// How long the runner gets to dial the control socket.
    const RUNNER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Grace between SIGTERM and SIGKILL at shutdown.
    const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    /// Brings the service up: directories, sockets, runner process,
    /// background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when any bootstrap step fails; nothing
    /// keeps running on error.
    pub async fn start(
        config: ServiceConfig,
        functions: FunctionRegistry,
    ) -> Result<Self, ServiceError> {
        std::fs::create_dir_all(&config.socket_dir)?;
        std::fs::create_dir_all(&config.log_dir)?;

        // UDFs close their sockets whenever they like; without this the
        // host would die on the next write instead of seeing an error.
        // Safety: SIG_IGN carries no handler state.
        unsafe {
            signal(Signal::SIGPIPE, SigHandler::SigIgn)
                .map_err(|e| std::io::Error::other(format!("ignore SIGPIPE: {e}")))?;
        }

        let rendezvous_path = config.rendezvous_socket_path();
        remove_stale_socket(&rendezvous_path)?;
        let rendezvous = tokio::net::UnixListener::bind(&rendezvous_path)?;

        let (runner, control_stream) =
            bootstrap_runner(&config, Self::RUNNER_CONNECT_TIMEOUT).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = ControlClient::start(control_stream, config.max_frame_len, events_tx.clone());
        let pool = Arc::new(WorkerPool::new(config.max_frame_len));
        let acceptor_task = tokio::spawn(run_acceptor(
            rendezvous,
            Arc::clone(&pool),
            events_tx,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            config,
            pool,
            control,
            Arc::new(Sideband::new()),
            Arc::new(functions),
        ));
        let event_task = dispatcher.spawn_event_task(events_rx);

        info!("udf service started");
        Ok(Self {
            dispatcher,
            runner,
            acceptor_task,
            event_task,
        })
    }

    /// The dispatch API.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stops the service: drains the runner, sweeps its process group,
    /// and stops the background tasks.
    pub async fn shutdown(self) {
        if let Err(e) = self.dispatcher.shutdown_runner().await {
            warn!(error = %e, "runner refused shutdown; killing");
        }
        self.runner.shutdown(Self::SHUTDOWN_GRACE).await;
        self.acceptor_task.abort();
        self.event_task.abort();
        info!("udf service stopped");
    }
}
