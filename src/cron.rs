// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Background periodic jobs (§9 "coroutine-like control flow via cron
//! jobs"): priority aging (12h, §4.D), rankings aging (2m, §4.F) and the
//! migration producer (§4.G) all share this one shape instead of the
//! teacher's two separate idioms (`rate_limit::Maint`'s parked-thread +
//! `Arc<AtomicBool>` stop flag, and `cache::urns::refresh`'s `Weak`-held
//! polling loop) — generalized here into a `tokio` task driven by an
//! interval plus a shared stop flag, since every AFS cron job is async I/O
//! bound (database calls, disk reads) rather than CPU-bound like the
//! rate-limiter sweep.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::time::{interval, Duration};

/// A handle to a spawned periodic task. Dropping it does not stop the task
/// (mirroring `rate_limit::Maint`, which only stops when the last clone is
/// dropped); call [`CronHandle::stop`] explicitly during shutdown.
pub struct CronHandle {
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl CronHandle {
    /// Spawns `job` to run once every `period`, until [`stop`] is called.
    /// `job` is re-invoked even if a prior call logged an error (§7:
    /// background jobs never abort the process on recoverable errors).
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_task = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if stop_task.load(Ordering::Acquire) {
                    tracing::debug!(job = name, "cron stopping");
                    break;
                }
                tracing::trace!(job = name, "cron tick");
                job().await;
            }
        });
        Self { stop, task }
    }

    /// Signals the task to stop at its next tick and waits for it to exit.
    pub async fn stop(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering as O};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn runs_periodically_until_stopped() {
        let count = Arc::new(AtomicU32::new(0));
        let handle = {
            let count = Arc::clone(&count);
            CronHandle::spawn("test", Duration::from_millis(10), move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, O::SeqCst);
                }
            })
        };
        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        handle.stop().await;
        assert!(count.load(O::SeqCst) >= 3);
    }
}
