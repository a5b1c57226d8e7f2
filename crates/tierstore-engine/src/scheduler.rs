//! Generic periodic task scheduler
//!
//! One abstraction drives every subsystem cycle: a jittered interval,
//! an overlap guard so a slow cycle is skipped rather than doubled,
//! and a watch-channel shutdown signal. Cycle bodies are synchronous
//! and run on the blocking pool.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A named periodic job
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    /// Fraction of the interval applied as random jitter per cycle
    jitter_fraction: f64,
    running: Arc<AtomicBool>,
}

impl PeriodicTask {
    #[must_use]
    pub fn new(name: &'static str, interval: Duration, jitter_fraction: f64) -> Self {
        Self {
            name,
            interval,
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the scheduling loop. The job runs on the blocking pool;
    /// a cycle that would overlap a still-running one is skipped.
    pub fn spawn(
        self,
        mut shutdown: watch::Receiver<bool>,
        job: impl Fn() + Send + Sync + 'static,
    ) -> JoinHandle<()> {
        let job = Arc::new(job);
        tokio::spawn(async move {
            debug!(task = self.name, interval_secs = self.interval.as_secs_f64(),
                "scheduler started");
            loop {
                let sleep = jittered(self.interval, self.jitter_fraction);
                tokio::select! {
                    () = tokio::time::sleep(sleep) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!(task = self.name, "scheduler stopping");
                            return;
                        }
                        continue;
                    }
                }
                if self.running.swap(true, Ordering::SeqCst) {
                    warn!(task = self.name, "previous cycle still running, skipping");
                    continue;
                }
                let job = Arc::clone(&job);
                let running = Arc::clone(&self.running);
                let name = self.name;
                tokio::task::spawn_blocking(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        job();
                    }));
                    running.store(false, Ordering::SeqCst);
                    if outcome.is_err() {
                        error!(task = name, "cycle panicked");
                    }
                });
            }
        })
    }
}

/// Interval scaled by a random factor in `1 ± jitter_fraction`
fn jittered(interval: Duration, jitter_fraction: f64) -> Duration {
    if jitter_fraction <= 0.0 {
        return interval;
    }
    let delta = rand::thread_rng().gen_range(-jitter_fraction..=jitter_fraction);
    interval.mul_f64(1.0 + delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let task = PeriodicTask::new("test", Duration::from_millis(10), 0.0);
        let handle = task.spawn(rx, {
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Let any in-flight blocking cycle finish before sampling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 3, "expected several cycles, got {runs}");

        // No further cycles after shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_overlap_guard_skips_slow_cycles() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let task = PeriodicTask::new("slow", Duration::from_millis(10), 0.0);
        let handle = task.spawn(rx, {
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(60));
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Without the guard a 10ms interval would fire ~15 times.
        let runs = counter.load(Ordering::SeqCst);
        assert!(runs <= 4, "overlap guard failed, {runs} concurrent cycles");
        assert!(runs >= 1);
    }
}
