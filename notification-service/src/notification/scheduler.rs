//! Periodic background passes.
//!
//! Each responsibility (batch flush, scheduled retry, dead-letter retry,
//! dead-letter cleanup) runs as its own task on its own interval. Tasks
//! observe a shared [`CancellationToken`] between ticks only, so an in-flight
//! pass always finishes before the task exits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

/// Ensures at most one pass of a given kind runs at a time.
#[derive(Debug, Default)]
pub struct PassGuard {
    running: AtomicBool,
}

impl PassGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` when a pass is already in progress.
    pub fn try_begin(&self) -> Option<PassToken<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassToken { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the guard on drop.
#[derive(Debug)]
pub struct PassToken<'a> {
    guard: &'a PassGuard,
}

impl Drop for PassToken<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Spawn a loop that runs `pass` every `period` until `token` is cancelled.
///
/// The first tick fires after one full period. Missed ticks are skipped, so a
/// slow pass delays the next one instead of queueing a burst.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(task = name, period_secs = period.as_secs_f64(), "Periodic task started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    debug!(task = name, "Running pass");
                    if let Err(e) = pass().await {
                        warn!(task = name, error = %e, "Pass failed");
                    }
                }
            }
        }
        info!(task = name, "Periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_pass_guard_is_exclusive() {
        let guard = PassGuard::new();
        let token = guard.try_begin();
        assert!(token.is_some());
        assert!(guard.is_running());
        assert!(guard.try_begin().is_none());

        drop(token);
        assert!(!guard.is_running());
        assert!(guard.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = count.clone();
        let handle = spawn_periodic("test", Duration::from_secs(10), token.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
        let after_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_pass_completes_before_exit() {
        let finished = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        let done = finished.clone();
        let handle = spawn_periodic("slow", Duration::from_secs(1), token.clone(), move || {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                done.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}
