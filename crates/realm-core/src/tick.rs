//! Ticks: countdown tasks driven by the simulation pulse.
//!
//! A tick fires on every pulse but only runs its body when its counter
//! reaches zero, after which the counter is reset to the interval.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::executor::Affinity;
use crate::task::{BoxError, Flow, RecurringTask, Task, TaskHandle};

/// Tick errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TickError {
    /// The tick already carries an identifier.
    #[error("Tick is already identified as {0}")]
    AlreadyIdentified(String),

    /// Only persistent ticks can be identified.
    #[error("Strict ticks cannot carry an identifier")]
    NotPersistent,

    /// The tick has no identifier to register under.
    #[error("Tick has no identifier")]
    Unidentified,

    /// Another live tick is registered under the same identifier.
    #[error("Identifier already registered: {0}")]
    Duplicate(String),
}

/// How a tick reacts to a changed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPolicy {
    /// Keep the elapsed fraction of the current countdown.
    Strict,
    /// Restart the countdown; may carry a stable identifier.
    Persistent,
}

#[derive(Debug)]
struct Countdown {
    counter: u32,
    interval: u32,
}

impl Countdown {
    fn new(interval: u32) -> Self {
        let interval = interval.max(1);
        Self {
            counter: interval,
            interval,
        }
    }

    /// One pulse; true when the countdown expired.
    fn pulse(&mut self) -> bool {
        self.counter = self.counter.saturating_sub(1);
        self.counter == 0
    }

    fn reset(&mut self) {
        self.counter = self.interval;
    }

    fn set_interval(&mut self, interval: u32, policy: TickPolicy) {
        let interval = interval.max(1);
        match policy {
            TickPolicy::Strict => {
                // Scale the elapsed pulses to the new interval.
                let elapsed = u64::from(self.interval - self.counter.min(self.interval));
                let carried = elapsed * u64::from(interval) / u64::from(self.interval);
                self.counter = (interval - carried as u32).max(1);
            }
            TickPolicy::Persistent => self.counter = interval,
        }
        self.interval = interval;
    }
}

struct TickShared {
    policy: TickPolicy,
    countdown: Mutex<Countdown>,
    identifier: OnceLock<String>,
}

impl TickShared {
    fn label(&self) -> &str {
        self.identifier.get().map_or("anonymous", String::as_str)
    }
}

type TickBody = Box<dyn FnMut() -> Result<bool, BoxError> + Send>;

/// A countdown driven by the simulation pulse.
pub struct Tick {
    shared: Arc<TickShared>,
    body: TickBody,
}

impl Tick {
    /// Create a tick running `body` every `interval` pulses.
    ///
    /// The body returns `Ok(false)` to stop the tick. Errors and panics are
    /// logged and the tick keeps running.
    #[must_use]
    pub fn new<F>(interval: u32, policy: TickPolicy, body: F) -> Self
    where
        F: FnMut() -> Result<bool, BoxError> + Send + 'static,
    {
        Self {
            shared: Arc::new(TickShared {
                policy,
                countdown: Mutex::new(Countdown::new(interval)),
                identifier: OnceLock::new(),
            }),
            body: Box::new(body),
        }
    }

    /// Create a strict tick.
    #[must_use]
    pub fn strict<F>(interval: u32, body: F) -> Self
    where
        F: FnMut() -> Result<bool, BoxError> + Send + 'static,
    {
        Self::new(interval, TickPolicy::Strict, body)
    }

    /// Create a persistent tick.
    #[must_use]
    pub fn persistent<F>(interval: u32, body: F) -> Self
    where
        F: FnMut() -> Result<bool, BoxError> + Send + 'static,
    {
        Self::new(interval, TickPolicy::Persistent, body)
    }

    /// Bind an identifier before scheduling.
    ///
    /// # Errors
    ///
    /// See [`TickHandle::bind_identifier`].
    pub fn with_identifier(self, identifier: impl Into<String>) -> Result<Self, TickError> {
        bind(&self.shared, identifier.into())?;
        Ok(self)
    }

    /// Wrap the tick into a recurring task firing every `pulse`.
    pub(crate) fn into_task(
        self,
        name: impl Into<String>,
        affinity: Affinity,
        pulse: Duration,
    ) -> (RecurringTask, TickHandle) {
        let shared = self.shared.clone();
        let task = RecurringTask::new(name, affinity, pulse, self);
        let handle = TickHandle {
            task: task.handle(),
            shared,
        };
        (task, handle)
    }

    /// Advance one pulse, running the body if the countdown expired.
    fn pulse(&mut self) -> Flow {
        if !self.shared.countdown.lock().pulse() {
            return Flow::Continue;
        }

        let keep = match catch_unwind(AssertUnwindSafe(|| (self.body)())) {
            Ok(Ok(keep)) => keep,
            Ok(Err(e)) => {
                warn!(tick = self.shared.label(), error = %e, "Tick failed");
                true
            }
            Err(_) => {
                error!(tick = self.shared.label(), "Tick panicked");
                true
            }
        };

        if keep {
            self.shared.countdown.lock().reset();
            Flow::Continue
        } else {
            debug!(tick = self.shared.label(), "Tick finished");
            Flow::Stop
        }
    }
}

#[async_trait]
impl Task for Tick {
    async fn run(&mut self) -> Result<Flow, BoxError> {
        Ok(self.pulse())
    }
}

fn bind(shared: &TickShared, identifier: String) -> Result<(), TickError> {
    if shared.policy != TickPolicy::Persistent {
        return Err(TickError::NotPersistent);
    }
    shared
        .identifier
        .set(identifier)
        .map_err(|_| TickError::AlreadyIdentified(shared.label().to_string()))
}

/// Handle to a scheduled tick.
#[derive(Clone)]
pub struct TickHandle {
    task: TaskHandle,
    shared: Arc<TickShared>,
}

impl TickHandle {
    /// The underlying task handle.
    #[must_use]
    pub fn task(&self) -> &TaskHandle {
        &self.task
    }

    /// The tick policy.
    #[must_use]
    pub fn policy(&self) -> TickPolicy {
        self.shared.policy
    }

    /// Pulses left until the body next runs.
    #[must_use]
    pub fn counter(&self) -> u32 {
        self.shared.countdown.lock().counter
    }

    /// Pulses between body runs.
    #[must_use]
    pub fn interval(&self) -> u32 {
        self.shared.countdown.lock().interval
    }

    /// Change the interval according to the tick policy.
    pub fn set_interval(&self, interval: u32) {
        self.shared
            .countdown
            .lock()
            .set_interval(interval, self.shared.policy);
    }

    /// The bound identifier, if any.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.shared.identifier.get().map(String::as_str)
    }

    /// Bind a stable identifier. Allowed once, on persistent ticks only.
    ///
    /// # Errors
    ///
    /// Returns an error if the tick is strict or already identified.
    pub fn bind_identifier(&self, identifier: impl Into<String>) -> Result<(), TickError> {
        bind(&self.shared, identifier.into())
    }

    /// Stop the tick.
    pub fn stop(&self) {
        self.task.stop();
    }

    /// Whether the tick is stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.task.is_stopped()
    }
}

impl std::fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickHandle")
            .field("identifier", &self.identifier())
            .field("policy", &self.policy())
            .field("counter", &self.counter())
            .field("interval", &self.interval())
            .finish()
    }
}

/// Lookup of live persistent ticks by identifier.
#[derive(Default)]
pub struct TickRegistry {
    ticks: DashMap<String, TickHandle>,
}

impl TickRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identified tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the tick has no identifier or a live tick is
    /// already registered under it.
    pub fn register(&self, handle: TickHandle) -> Result<(), TickError> {
        let identifier = handle.identifier().ok_or(TickError::Unidentified)?.to_string();
        match self.ticks.entry(identifier.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if !existing.get().is_stopped() {
                    return Err(TickError::Duplicate(identifier));
                }
                existing.insert(handle);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }
        Ok(())
    }

    /// Find a live tick.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<TickHandle> {
        let handle = self.ticks.get(identifier)?.clone();
        if handle.is_stopped() {
            self.ticks.remove_if(identifier, |_, h| h.is_stopped());
            return None;
        }
        Some(handle)
    }

    /// Stop and forget a tick. Returns whether a live tick was found.
    pub fn stop(&self, identifier: &str) -> bool {
        match self.ticks.remove(identifier) {
            Some((_, handle)) => {
                let was_live = !handle.is_stopped();
                handle.stop();
                was_live
            }
            None => false,
        }
    }

    /// Drop entries of stopped ticks and return how many remain.
    pub fn prune(&self) -> usize {
        self.ticks.retain(|_, handle| !handle.is_stopped());
        self.ticks.len()
    }
}
