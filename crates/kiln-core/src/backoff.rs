//! Respawn policy for workers that die during startup.
//!
//! A worker that exits non-zero before reaching rendezvous is respawned up
//! to a retry cap; each attempt waits longer than the last. A worker that
//! does reach rendezvous resets its token's failure streak. Exhausting the
//! cap marks the code entry unhealthy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule between respawn attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay every attempt.
    Fixed {
        /// Delay duration.
        #[serde(with = "crate::config::humantime_serde")]
        delay: Duration,
    },

    /// Delay doubles (by `multiplier`) each attempt, capped.
    Exponential {
        /// First attempt's delay.
        #[serde(with = "crate::config::humantime_serde")]
        initial_delay: Duration,
        /// Upper clamp.
        #[serde(with = "crate::config::humantime_serde")]
        max_delay: Duration,
        /// Growth factor per attempt.
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempts stay tiny
                let scaled = initial_delay.as_secs_f64() * multiplier.powi(attempt as i32 - 1);
                Duration::from_secs_f64(scaled).min(*max_delay)
            }
        }
    }
}

/// Respawn policy: how many startup failures a token tolerates, and how
/// long to wait between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespawnPolicy {
    /// Startup-phase respawns allowed before the entry is unhealthy.
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,

    /// Delay schedule.
    #[serde(default)]
    pub backoff: Backoff,
}

const fn default_retry_cap() -> u32 {
    3
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            retry_cap: default_retry_cap(),
            backoff: Backoff::default(),
        }
    }
}

/// Per-token failure streak, owned by the runner's reaper.
#[derive(Debug, Default)]
pub struct RespawnTracker {
    consecutive_failures: u32,
}

impl RespawnTracker {
    /// Creates a tracker with no recorded failures.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            consecutive_failures: 0,
        }
    }

    /// Records a startup failure. Returns the delay to wait before the
    /// next attempt, or `None` when the policy's cap is exhausted.
    pub fn record_failure(&mut self, policy: &RespawnPolicy) -> Option<Duration> {
        self.consecutive_failures += 1;
        if self.consecutive_failures > policy.retry_cap {
            return None;
        }
        Some(policy.backoff.delay_for_attempt(self.consecutive_failures))
    }

    /// Records that a worker reached rendezvous, clearing the streak.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Current streak length.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn fixed_is_flat() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_millis(50));
    }

    #[test]
    fn tracker_exhausts_at_cap() {
        let policy = RespawnPolicy {
            retry_cap: 3,
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(1),
            },
        };
        let mut tracker = RespawnTracker::new();
        assert!(tracker.record_failure(&policy).is_some());
        assert!(tracker.record_failure(&policy).is_some());
        assert!(tracker.record_failure(&policy).is_some());
        assert_eq!(tracker.record_failure(&policy), None);
    }

    #[test]
    fn success_resets_streak() {
        let policy = RespawnPolicy::default();
        let mut tracker = RespawnTracker::new();
        tracker.record_failure(&policy);
        tracker.record_failure(&policy);
        tracker.record_success();
        assert_eq!(tracker.failures(), 0);
        assert!(tracker.record_failure(&policy).is_some());
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = RespawnPolicy::default();
        assert_eq!(policy.retry_cap, 3);
        assert_eq!(
            policy.backoff.delay_for_attempt(1),
            Duration::from_millis(100)
        );
    }
}
