//! Small synchronization helpers shared by connections and managers.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use tokio::sync::Notify;
use tracing::error;

/// Completion counter: `add` before work starts, `done` when it ends, `wait`
/// until the count drains to zero.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    drained: Notify,
}

impl WaitGroup {
    /// Create an empty wait group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` more pending units of work.
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one unit of work finished. Extra calls are ignored.
    pub fn done(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if prev == Ok(1) {
            self.drained.notify_waiters();
        }
    }

    /// Number of pending units.
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until every registered unit has called [`WaitGroup::done`].
    pub async fn wait(&self) {
        loop {
            // Register interest before checking, so a concurrent `done` cannot
            // slip between the check and the await.
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Run `fut`, converting a panic into a logged, local termination.
///
/// Returns `false` when the future panicked.
pub(crate) async fn fault_barrier<F>(conn_id: u64, duty: &'static str, fut: F) -> bool
where
    F: Future<Output = ()>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => true,
        Err(payload) => {
            metrics::counter!("wirepool_duty_panics_total", "duty" => duty).increment(1);
            error!(
                conn_id,
                duty,
                panic = panic_message(payload.as_ref()),
                backtrace = %Backtrace::force_capture(),
                "duty panicked"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
