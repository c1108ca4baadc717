//! Crash-respawn throttling.
//!
//! The delay for the n-th crash inside the window is `first × 2^(n-1)`,
//! capped at `max`. More than `max_restarts` crashes inside the window
//! leave the template degraded.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::models::TemplateId;

/// Limits applied to crash respawns of one template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Crash respawns allowed inside `window`.
    pub max_restarts: u32,
    /// Sliding window over which crashes are counted.
    pub window: Duration,
    /// Delay before the first respawn.
    pub backoff_first: Duration,
    /// Delay cap.
    pub backoff_max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff_first: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Delay before the `attempt`-th respawn (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1_u32 << exponent;
        self.backoff_first
            .checked_mul(factor)
            .map_or(self.backoff_max, |delay| delay.min(self.backoff_max))
    }
}

/// Outcome of a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after the delay.
    RespawnAfter(Duration),
    /// Crash budget exhausted; do not respawn.
    GiveUp {
        /// Crashes counted inside the window, including this one.
        crashes: u32,
    },
}

/// Per-template crash history.
#[derive(Debug, Default)]
pub struct RestartGuard {
    policy: RestartPolicy,
    history: HashMap<TemplateId, VecDeque<Instant>>,
}

impl RestartGuard {
    /// Guard enforcing `policy`.
    #[must_use]
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            history: HashMap::new(),
        }
    }

    /// Record a crash of `template` at `now` and decide what to do.
    pub fn on_crash(&mut self, template: TemplateId, now: Instant) -> RestartDecision {
        let window = self.policy.window;
        let crashes = self.history.entry(template).or_default();
        while crashes
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            crashes.pop_front();
        }
        crashes.push_back(now);

        let count = u32::try_from(crashes.len()).unwrap_or(u32::MAX);
        if count > self.policy.max_restarts {
            return RestartDecision::GiveUp { crashes: count };
        }
        RestartDecision::RespawnAfter(self.policy.backoff(count))
    }

    /// Policy in force.
    #[must_use]
    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}
