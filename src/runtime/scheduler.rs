//! Deferred cleanup scheduling
//!
//! The registry schedules one delayed cleanup tick after each release. The
//! timer is a pluggable [`CleanupScheduler`] so embedders decide where ticks
//! run: on a tokio runtime, or by hand in tests.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Work item run when a tick fires
pub type CleanupTask = Box<dyn FnOnce() + Send + 'static>;

/// Timer abstraction for deferred cleanup ticks
pub trait CleanupScheduler: Send + Sync {
    /// Run `task` once, no earlier than `delay` from now
    fn schedule(&self, delay: Duration, task: CleanupTask);
}

/// Scheduler backed by a tokio runtime.
///
/// Ticks run on the blocking pool since disposing a callee may block.
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Schedule onto the given runtime
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Schedule onto the runtime of the calling context, if any
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl CleanupScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: CleanupTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = tokio::task::spawn_blocking(task).await {
                tracing::warn!(%err, "cleanup tick failed");
            }
        });
    }
}

struct PendingTick {
    due: Instant,
    task: CleanupTask,
}

/// Scheduler that only queues ticks; the owner fires them explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<PendingTick>>,
}

impl ManualScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued ticks
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fire every queued tick regardless of its due time. Returns the count.
    pub fn run_all(&self) -> usize {
        let ticks: Vec<PendingTick> = std::mem::take(&mut *self.pending.lock());
        let count = ticks.len();
        for tick in ticks {
            (tick.task)();
        }
        count
    }

    /// Fire ticks whose due time has passed. Returns the count.
    pub fn run_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<PendingTick> = {
            let mut pending = self.pending.lock();
            let (due, later) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|tick| tick.due <= now);
            *pending = later;
            due
        };
        let count = due.len();
        for tick in due {
            (tick.task)();
        }
        count
    }
}

impl CleanupScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: CleanupTask) {
        self.pending.lock().push(PendingTick {
            due: Instant::now() + delay,
            task,
        });
    }
}
