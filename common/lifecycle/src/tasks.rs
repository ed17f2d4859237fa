//! Outstanding background work accounting.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::metrics;

/// Counts units of background work so shutdown can wait until all of them have finished.
///
/// Every [`register`](BackgroundTasks::register) must be paired with exactly one
/// [`complete`](BackgroundTasks::complete). Register from the code that schedules the unit,
/// before scheduling it, never from inside the unit itself: otherwise the count can reach
/// zero while the unit is still waiting to be polled. Prefer [`spawn`](BackgroundTasks::spawn)
/// or [`track`](BackgroundTasks::track), which pair the calls on every exit path.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    outstanding: AtomicUsize,
    drained: Notify,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) {
        let outstanding = self.inner.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::emit_background_tasks(outstanding);
    }

    /// Marks one registered unit as finished.
    ///
    /// # Panics
    ///
    /// Panics if called more times than [`register`](BackgroundTasks::register). The count is
    /// left untouched so waiters never observe a wrapped value.
    pub fn complete(&self) {
        let previous = self
            .inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                metrics::emit_background_tasks(0);
                self.inner.drained.notify_waiters();
            }
            Ok(n) => metrics::emit_background_tasks(n - 1),
            Err(_) => panic!("complete called without a matching register"),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Resolves once the outstanding count is zero. Unbounded: callers that need a ceiling
    /// wrap this in `tokio::time::timeout`.
    pub async fn wait(&self) {
        loop {
            // Arm before checking so a completion between the check and the await is not lost.
            let drained = self.inner.drained.notified();
            if self.outstanding() == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Registers one unit and returns a guard that completes it when dropped.
    pub fn track(&self) -> TaskGuard {
        self.register();
        TaskGuard {
            tasks: self.clone(),
        }
    }

    /// Registers a unit of background work and runs it on the tokio runtime.
    ///
    /// The unit is completed however it ends. A panic is caught and logged instead of being
    /// left on the join handle nobody awaits.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.track();
        debug!(task = name, "background task scheduled");

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown".to_string());
                error!(task = name, reason = %reason, "background task panicked");
            }
        });
    }
}

/// Completes its unit of background work on drop, including unwinding.
#[must_use = "the unit is completed as soon as the guard is dropped"]
pub struct TaskGuard {
    tasks: BackgroundTasks,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tasks.complete();
    }
}
