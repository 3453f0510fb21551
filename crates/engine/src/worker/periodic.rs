//! Periodic background jobs
//!
//! Retention cleanup, the scheduled-trigger poller and the stalled
//! execution sweeper all run on a fixed tick until shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::engine::EngineError;

/// A job run on every tick
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// One pass of the job; errors are logged and the next tick runs as usual
    async fn tick(&self) -> Result<(), EngineError>;
}

/// Runs a [`PeriodicJob`] on an interval
pub struct PeriodicTask {
    job: Arc<dyn PeriodicJob>,
    interval: Duration,
}

impl PeriodicTask {
    pub fn new(job: Arc<dyn PeriodicJob>, interval: Duration) -> Self {
        Self {
            job,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Spawn the tick loop; it exits when `shutdown_rx` flips
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.job.tick().await {
                            error!(job = self.job.name(), error = %e, "periodic job failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(job = self.job.name(), "periodic job: shutdown requested");
                        break;
                    }
                }
            }

            debug!(job = self.job.name(), "periodic job exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicJob for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) -> Result<(), EngineError> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(StoreError::Database("first tick fails".into()).into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ticks_survive_errors_and_stop_on_shutdown() {
        let job = Arc::new(Counting {
            ticks: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let handle = PeriodicTask::new(job.clone(), Duration::from_millis(10)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let ticks = job.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected several ticks, got {ticks}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), ticks);
    }
}
