//! Per-execution watchdog.
//!
//! Every execute task arms one watchdog covering worker acquisition and
//! the response wait. The watchdog resolves on whichever comes first:
//! the request deadline or an explicit cancellation. The execute task
//! races it against worker I/O with `select!`; response arrival simply
//! drops the watchdog, which disarms it.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why the watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The request deadline passed.
    Deadline,
    /// The request was cancelled (explicit cancel or delete drain).
    Cancelled,
}

/// Deadline-or-cancel guard for one execute.
#[derive(Debug)]
pub struct Watchdog {
    deadline: Instant,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Arms a watchdog for `deadline`, observing `cancel`.
    #[must_use]
    pub const fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// The armed deadline.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolves when the deadline passes or the request is cancelled.
    ///
    /// Cancellation wins a tie so an explicit cancel racing the deadline
    /// reports `Cancelled` deterministically.
    pub async fn interrupted(&self) -> Interrupt {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Interrupt::Cancelled,
            () = tokio::time::sleep_until(self.deadline) => Interrupt::Deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_on_deadline() {
        let watchdog = Watchdog::new(
            Instant::now() + Duration::from_secs(1),
            CancellationToken::new(),
        );
        assert_eq!(watchdog.interrupted().await, Interrupt::Deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_preempts_deadline() {
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::new(Instant::now() + Duration::from_secs(60), cancel.clone());
        cancel.cancel();
        assert_eq!(watchdog.interrupted().await, Interrupt::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_wins_tie() {
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::new(Instant::now(), cancel.clone());
        cancel.cancel();
        assert_eq!(watchdog.interrupted().await, Interrupt::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn response_first_never_observes_interrupt() {
        let watchdog = Watchdog::new(
            Instant::now() + Duration::from_secs(5),
            CancellationToken::new(),
        );
        let quick = async { 7 };
        let result = tokio::select! {
            value = quick => Some(value),
            _ = watchdog.interrupted() => None,
        };
        assert_eq!(result, Some(7));
    }
}
