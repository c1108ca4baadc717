//! Reload strategies evaluated inside a worker.
//!
//! Every runtime event is offered to every strategy. The trigger requests
//! a reload from the runtime at most once, the first time any strategy
//! votes for it; strategy order therefore never matters.

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use super::RuntimeHandle;

/// Events a running worker reports to its reload trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A lifecycle handler returned an error.
    HookFailed {
        /// Rendered error.
        message: String,
    },
    /// The worker finished handling one request.
    RequestHandled,
    /// Periodic self-measurement.
    Heartbeat {
        /// Resident memory in bytes.
        memory: u64,
        /// Time since the runtime started.
        uptime: Duration,
    },
}

/// Decides from runtime events whether the worker should be recycled.
pub trait ReloadStrategy: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Observe an event; `true` votes for a reload.
    fn should_reload(&mut self, event: &RuntimeEvent) -> bool;
}

/// Reload after any handler failure whose message matches none of the
/// ignored substrings.
#[derive(Debug, Clone, Default)]
pub struct OnException {
    ignore: Vec<String>,
}

impl OnException {
    /// Strategy that ignores failures containing any of `ignore`.
    #[must_use]
    pub fn new(ignore: Vec<String>) -> Self {
        Self { ignore }
    }
}

impl ReloadStrategy for OnException {
    fn name(&self) -> &'static str {
        "on_exception"
    }

    fn should_reload(&mut self, event: &RuntimeEvent) -> bool {
        match event {
            RuntimeEvent::HookFailed { message } => {
                !self.ignore.iter().any(|pattern| message.contains(pattern.as_str()))
            }
            _ => false,
        }
    }
}

/// Reload once a worker has handled `max` requests.
#[derive(Debug, Clone)]
pub struct MaxRequests {
    max: u64,
    handled: u64,
}

impl MaxRequests {
    /// Strategy firing on the `max`-th request.
    #[must_use]
    pub fn new(max: u64) -> Self {
        Self { max, handled: 0 }
    }
}

impl ReloadStrategy for MaxRequests {
    fn name(&self) -> &'static str {
        "max_requests"
    }

    fn should_reload(&mut self, event: &RuntimeEvent) -> bool {
        if *event == RuntimeEvent::RequestHandled {
            self.handled += 1;
            return self.handled >= self.max;
        }
        false
    }
}

/// Reload once resident memory reaches a limit.
#[derive(Debug, Clone)]
pub struct MaxMemory {
    bytes: u64,
}

impl MaxMemory {
    /// Strategy firing at `bytes` of resident memory.
    #[must_use]
    pub fn new(bytes: u64) -> Self {
        Self { bytes }
    }
}

impl ReloadStrategy for MaxMemory {
    fn name(&self) -> &'static str {
        "max_memory"
    }

    fn should_reload(&mut self, event: &RuntimeEvent) -> bool {
        matches!(event, RuntimeEvent::Heartbeat { memory, .. } if *memory >= self.bytes)
    }
}

/// Reload once a worker has lived for a fixed time.
#[derive(Debug, Clone)]
pub struct Ttl {
    lifetime: Duration,
}

impl Ttl {
    /// Strategy firing after `lifetime`.
    #[must_use]
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime }
    }
}

impl ReloadStrategy for Ttl {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn should_reload(&mut self, event: &RuntimeEvent) -> bool {
        matches!(event, RuntimeEvent::Heartbeat { uptime, .. } if *uptime >= self.lifetime)
    }
}

/// Declarative form of the built-in strategies, as written in TOML.
///
/// ```toml
/// reload_strategies = [
///     { kind = "max_requests", max = 10000 },
///     { kind = "ttl", seconds = 3600 },
/// ]
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReloadStrategyConfig {
    /// See [`OnException`].
    OnException {
        /// Substrings of failures that do not trigger a reload.
        #[serde(default)]
        ignore: Vec<String>,
    },
    /// See [`MaxRequests`].
    MaxRequests {
        /// Request limit.
        max: u64,
    },
    /// See [`MaxMemory`].
    MaxMemory {
        /// Memory limit in bytes.
        bytes: u64,
    },
    /// See [`Ttl`].
    Ttl {
        /// Lifetime in seconds.
        seconds: u64,
    },
}

impl ReloadStrategyConfig {
    /// Instantiate the strategy with fresh counters.
    #[must_use]
    pub fn build(&self) -> Box<dyn ReloadStrategy> {
        match self {
            Self::OnException { ignore } => Box::new(OnException::new(ignore.clone())),
            Self::MaxRequests { max } => Box::new(MaxRequests::new(*max)),
            Self::MaxMemory { bytes } => Box::new(MaxMemory::new(*bytes)),
            Self::Ttl { seconds } => Box::new(Ttl::new(Duration::from_secs(*seconds))),
        }
    }
}

/// Fans runtime events out to the strategies and fires one reload.
pub struct ReloadStrategyTrigger {
    strategies: Vec<Box<dyn ReloadStrategy>>,
    runtime: RuntimeHandle,
    fired: bool,
}

impl ReloadStrategyTrigger {
    /// Trigger sending its reload request to `runtime`.
    #[must_use]
    pub fn new(runtime: RuntimeHandle, strategies: Vec<Box<dyn ReloadStrategy>>) -> Self {
        Self {
            strategies,
            runtime,
            fired: false,
        }
    }

    /// Append a strategy.
    pub fn add_strategy(&mut self, strategy: Box<dyn ReloadStrategy>) {
        self.strategies.push(strategy);
    }

    /// Offer an event to every strategy.
    ///
    /// Returns `true` only on the call that requested the reload.
    pub fn emit_event(&mut self, event: &RuntimeEvent) -> bool {
        let mut voters = Vec::new();
        for strategy in &mut self.strategies {
            if strategy.should_reload(event) {
                voters.push(strategy.name());
            }
        }

        if voters.is_empty() || self.fired {
            return false;
        }
        self.fired = true;
        info!(strategies = ?voters, "reload strategy fired");
        self.runtime.reload();
        true
    }

    /// Whether a reload has already been requested.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
