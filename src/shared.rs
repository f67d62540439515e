// shared.rs
// Thread-safe handle around one Scheduler instance.
//
// All mutations go through a single mutex, so every scheduler operation is
// applied atomically. The scheduler never blocks or does I/O, which keeps
// lock hold times short; the lock must never be held across an await.

use crate::scheduler::{Scheduler, SchedulerSnapshot};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

#[derive(Clone)]
pub struct SharedScheduler {
    inner: Arc<Mutex<Scheduler>>,
}

impl SharedScheduler {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(scheduler)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("scheduler lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    /// Run a read-only closure against the scheduler
    pub fn with<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> R {
        f(&*self.lock())
    }

    /// Run a mutating closure against the scheduler as one atomic step
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        f(&mut *self.lock())
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.with(Scheduler::snapshot_state)
    }
}

impl From<Scheduler> for SharedScheduler {
    fn from(scheduler: Scheduler) -> Self {
        Self::new(scheduler)
    }
}
