//! Periodic cleanup of in-process state
//!
//! Expired cache entries, lapsed fallback counters and expired in-process
//! store keys are already invisible to readers; the [`Sweeper`] frees their
//! memory on a fixed interval.

use crate::cache::TtlCache;
use crate::metrics;
use crate::rate_limit::LocalRateLimiter;
use crate::store::MemoryStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Something holding expirable state
#[async_trait]
pub trait Sweep: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Remove expired state; returns how many items were removed
    async fn sweep(&self) -> usize;
}

#[async_trait]
impl<T> Sweep for TtlCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        TtlCache::name(self)
    }

    async fn sweep(&self) -> usize {
        TtlCache::sweep(self).await
    }
}

#[async_trait]
impl Sweep for LocalRateLimiter {
    fn name(&self) -> &str {
        "local_rate_limiter"
    }

    async fn sweep(&self) -> usize {
        self.purge_expired()
    }
}

#[async_trait]
impl Sweep for MemoryStore {
    fn name(&self) -> &str {
        "memory_store"
    }

    async fn sweep(&self) -> usize {
        self.purge_expired()
    }
}

/// Runs every registered [`Sweep`] target on an interval
pub struct Sweeper {
    interval: Duration,
    targets: Vec<Arc<dyn Sweep>>,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("interval", &self.interval)
            .field(
                "targets",
                &self.targets.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Sweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            targets: Vec::new(),
        }
    }

    pub fn register(mut self, target: Arc<dyn Sweep>) -> Self {
        self.targets.push(target);
        self
    }

    /// Run one pass over all targets; returns the total removed
    pub async fn run_once(&self) -> usize {
        sweep_all(&self.targets).await
    }

    /// Start the background task
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = self.interval;
        let targets = self.targets;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(
                interval_secs = period.as_secs(),
                targets = targets.len(),
                "Started expiry sweeper"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep_all(&targets).await;
                    }
                    _ = &mut shutdown_rx => {
                        info!("Stopping expiry sweeper");
                        break;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

async fn sweep_all(targets: &[Arc<dyn Sweep>]) -> usize {
    let mut total = 0;
    for target in targets {
        let removed = target.sweep().await;
        metrics::record_sweep(target.name(), removed);
        if removed > 0 {
            debug!(target = target.name(), removed = removed, "Swept expired entries");
        }
        total += removed;
    }
    total
}

/// Handle to a running [`Sweeper`]. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Expiry sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::RateLimitPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTarget {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Sweep for CountingTarget {
        fn name(&self) -> &str {
            "counting"
        }

        async fn sweep(&self) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            1
        }
    }

    #[tokio::test]
    async fn test_run_once_sweeps_cache_and_limiter() {
        let clock = ManualClock::new(0);
        let cache: TtlCache<u32> =
            TtlCache::with_clock("test", 100, Duration::from_secs(1), Arc::new(clock.clone()));
        let limiter = LocalRateLimiter::new(Arc::new(clock.clone()));
        let policy = RateLimitPolicy::new("test", 5, 1).unwrap();

        cache.set_default("a", 1).await;
        limiter.check_rate_limit(&policy, "k");

        let sweeper = Sweeper::new(Duration::from_secs(60))
            .register(Arc::new(cache.clone()))
            .register(Arc::new(limiter.clone()));

        assert_eq!(sweeper.run_once().await, 0);

        clock.set(1_000);
        assert_eq!(sweeper.run_once().await, 2);
        assert_eq!(limiter.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_run_once_sweeps_memory_store() {
        use crate::store::{Store, WindowRequest};

        let store = MemoryStore::new();
        store
            .record_hit("rl:ip:10.0.0.1", &WindowRequest::new(0, 1, 3))
            .await
            .unwrap();
        store
            .set("cache:k", "v", Some(Duration::from_millis(1)))
            .await
            .unwrap();

        let sweeper = Sweeper::new(Duration::from_secs(60)).register(Arc::new(store.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sweeper.run_once().await, 2);
        assert_eq!(sweeper.run_once().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_ticks_until_shutdown() {
        let target = Arc::new(CountingTarget {
            calls: AtomicUsize::new(0),
        });
        let handle = Sweeper::new(Duration::from_secs(10))
            .register(target.clone())
            .spawn();

        tokio::time::sleep(Duration::from_secs(35)).await;
        let calls = target.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 3);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), calls);
    }
}
