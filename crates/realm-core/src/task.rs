//! Recurring tasks.
//!
//! A [`RecurringTask`] pairs scheduling data (affinity, delays) with a
//! pluggable [`Task`] behavior. Its [`TaskHandle`] exists from construction,
//! so stopping a task that has not been armed yet simply marks it stopped and
//! the executor never arms it.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::executor::{Affinity, Lane};

/// Boxed error returned by task bodies and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shortest period a recurring task may have.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// What a task wants after one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Re-arm for another period.
    Continue,
    /// Stop permanently.
    Stop,
}

/// Behavior run each time a recurring task fires.
///
/// Errors are logged by the executor and do not stop the task.
#[async_trait]
pub trait Task: Send + 'static {
    async fn run(&mut self) -> Result<Flow, BoxError>;
}

struct FnTask<F>(F);

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: FnMut() -> Result<Flow, BoxError> + Send + 'static,
{
    async fn run(&mut self) -> Result<Flow, BoxError> {
        (self.0)()
    }
}

/// Adapt a synchronous closure into a [`Task`].
pub fn task_fn<F>(f: F) -> impl Task
where
    F: FnMut() -> Result<Flow, BoxError> + Send + 'static,
{
    FnTask(f)
}

/// Lifecycle state of a recurring task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Built but not yet armed by an executor.
    Created = 0,
    /// Armed and waiting for its next firing.
    Scheduled = 1,
    /// Currently executing its body.
    Running = 2,
    /// Terminal.
    Stopped = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Scheduled,
            2 => TaskState::Running,
            _ => TaskState::Stopped,
        }
    }
}

struct Control {
    name: String,
    state: AtomicU8,
    cancel: CancellationToken,
    period: watch::Sender<Duration>,
    firings: AtomicU64,
}

impl Control {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Cancel handle of a recurring task.
#[derive(Clone)]
pub struct TaskHandle {
    control: Arc<Control>,
}

impl TaskHandle {
    fn new(name: String, period: Duration) -> Self {
        let (period, _) = watch::channel(period);
        Self {
            control: Arc::new(Control {
                name,
                state: AtomicU8::new(TaskState::Created as u8),
                cancel: CancellationToken::new(),
                period,
                firings: AtomicU64::new(0),
            }),
        }
    }

    /// Task name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.control.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Whether the task reached its terminal state.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == TaskState::Stopped
    }

    /// Number of completed firings.
    #[must_use]
    pub fn firings(&self) -> u64 {
        self.control.firings.load(Ordering::Acquire)
    }

    /// Current period.
    #[must_use]
    pub fn period(&self) -> Duration {
        *self.control.period.borrow()
    }

    /// Stop the task. No firing starts after this returns; a firing already
    /// in progress runs to completion.
    pub fn stop(&self) {
        let previous = self
            .control
            .state
            .swap(TaskState::Stopped as u8, Ordering::AcqRel);
        self.control.cancel.cancel();
        if previous != TaskState::Stopped as u8 {
            debug!(task = %self.control.name, "Task stopped");
        }
    }

    /// Replace the period. The pending timer is cancelled and re-armed with
    /// the new period, counted from now.
    pub fn set_period(&self, period: Duration) {
        self.control.period.send_replace(period.max(MIN_PERIOD));
    }

    /// Wait until the task is stopped.
    pub async fn stopped(&self) {
        self.control.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.control.name)
            .field("state", &self.state())
            .field("firings", &self.firings())
            .finish()
    }
}

/// A task re-armed at a fixed period until stopped.
pub struct RecurringTask {
    affinity: Affinity,
    initial_delay: Duration,
    behavior: Box<dyn Task>,
    handle: TaskHandle,
}

impl RecurringTask {
    /// Create a task firing every `period`, first after one period.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        affinity: Affinity,
        period: Duration,
        behavior: impl Task,
    ) -> Self {
        let period = period.max(MIN_PERIOD);
        Self {
            affinity,
            initial_delay: period,
            behavior: Box::new(behavior),
            handle: TaskHandle::new(name.into(), period),
        }
    }

    /// Override the delay before the first firing.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// The lane this task runs on.
    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// A handle to this task. Valid before the task is scheduled.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Drive the task on a lane until it stops.
    pub(crate) async fn drive(self, lane: Arc<Lane>) {
        let RecurringTask {
            initial_delay,
            mut behavior,
            handle,
            ..
        } = self;
        let control = handle.control.clone();

        if !control.transition(TaskState::Created, TaskState::Scheduled) {
            trace!(task = %control.name, "Task stopped before it was armed");
            return;
        }

        let mut period = control.period.subscribe();
        let mut delay = initial_delay;

        loop {
            tokio::select! {
                biased;
                _ = control.cancel.cancelled() => break,
                _ = lane.shutdown_signal() => break,
                changed = period.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    delay = *period.borrow_and_update();
                    trace!(task = %control.name, ?delay, "Task re-armed");
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(permit) = lane.permit().await else {
                break;
            };
            if !control.transition(TaskState::Scheduled, TaskState::Running) {
                break;
            }

            let outcome = AssertUnwindSafe(behavior.run()).catch_unwind().await;
            drop(permit);
            control.firings.fetch_add(1, Ordering::AcqRel);
            lane.record_firing();

            let flow = match outcome {
                Ok(Ok(flow)) => flow,
                Ok(Err(e)) => {
                    lane.record_fault();
                    warn!(task = %control.name, lane = lane.name(), error = %e, "Task failed");
                    Flow::Continue
                }
                Err(_) => {
                    lane.record_fault();
                    error!(task = %control.name, lane = lane.name(), "Task panicked");
                    Flow::Continue
                }
            };

            if flow == Flow::Stop || !control.transition(TaskState::Running, TaskState::Scheduled) {
                break;
            }
            delay = *period.borrow_and_update();
        }

        handle.stop();
    }
}

impl std::fmt::Debug for RecurringTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringTask")
            .field("name", &self.handle.name())
            .field("affinity", &self.affinity)
            .field("initial_delay", &self.initial_delay)
            .field("period", &self.handle.period())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_exists_before_scheduling() {
        let task = RecurringTask::new(
            "noop",
            Affinity::Service,
            Duration::from_millis(100),
            task_fn(|| Ok(Flow::Continue)),
        );
        let handle = task.handle();
        assert_eq!(handle.state(), TaskState::Created);

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_period_is_clamped() {
        let task = RecurringTask::new(
            "zero",
            Affinity::Parallel,
            Duration::ZERO,
            task_fn(|| Ok(Flow::Continue)),
        );
        assert_eq!(task.handle().period(), MIN_PERIOD);
    }
}
