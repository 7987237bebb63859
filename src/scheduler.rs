use std::cmp::min;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time;
use tracing::trace;

/// What a back-off or fixed-rate task wants to happen after it fired
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskOutcome {
    Reschedule,
    Done,
}

/// Handle for cancelling a scheduled task.
///
/// NB: Cancellation is best effort. A task that already started executing when it is cancelled
///      may still run to its next suspension point, so tasks must re-check whether the state they
///      act on is still live rather than relying on cancellation alone.
#[derive(Debug)]
pub struct TaskHandle {
    abort_handle: AbortHandle,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.abort_handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished()
    }
}

/// Timer abstraction shared by sender and receiver windows. All tasks run on the tokio runtime
///  the scheduler was created on, so there is no thread per task.
#[derive(Clone, Debug)]
pub struct RetransmitScheduler {
    runtime: Handle,
}

impl RetransmitScheduler {
    /// NB: This must be called from within a tokio runtime
    pub fn new() -> RetransmitScheduler {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> RetransmitScheduler {
        RetransmitScheduler { runtime }
    }

    /// runs `task` once after `delay`
    pub fn schedule<F, Fut>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join_handle = self.runtime.spawn(async move {
            time::sleep(delay).await;
            task().await;
        });
        TaskHandle { abort_handle: join_handle.abort_handle() }
    }

    /// Runs `task` after `intervals[0]`, then after `intervals[1]` and so on, repeating the last
    ///  interval indefinitely, until the task returns [TaskOutcome::Done] or is cancelled. The
    ///  task is passed the number of the attempt, starting at 0.
    pub fn schedule_backoff<F, Fut>(&self, intervals: Arc<[Duration]>, mut task: F) -> TaskHandle
    where
        F: FnMut(usize) -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        assert!(!intervals.is_empty(), "back-off requires at least one interval");

        let join_handle = self.runtime.spawn(async move {
            let mut attempt = 0usize;
            loop {
                let interval = intervals[min(attempt, intervals.len() - 1)];
                time::sleep(interval).await;

                if task(attempt).await == TaskOutcome::Done {
                    trace!("back-off task done after {} attempts", attempt + 1);
                    break;
                }
                attempt += 1;
            }
        });
        TaskHandle { abort_handle: join_handle.abort_handle() }
    }

    /// runs `task` every `period`, starting one period from now
    pub fn schedule_at_fixed_rate<F, Fut>(&self, period: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let join_handle = self.runtime.spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if task().await == TaskOutcome::Done {
                    break;
                }
            }
        });
        TaskHandle { abort_handle: join_handle.abort_handle() }
    }
}
