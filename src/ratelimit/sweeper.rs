//! Background eviction of idle callers.
//!
//! The sweep takes the caller registry lock once per tick, only long enough to
//! drop stale records. Admission checks never wait on the sweep schedule.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::RateLimiter;

/// Periodically forgets callers idle for longer than the limiter's timeout.
#[derive(Debug)]
pub struct CallerSweeper {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl CallerSweeper {
    /// Sweeper using the limiter's configured interval.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        let interval = limiter.config().sweep_interval;
        Self::with_interval(limiter, interval)
    }

    pub fn with_interval(limiter: Arc<RateLimiter>, interval: Duration) -> Self {
        Self {
            limiter,
            interval,
            stop_tx: None,
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; eviction runs in a spawned task.
    pub fn start(&mut self) -> JoinHandle<()> {
        let limiter = self.limiter.clone();
        let period = self.interval;
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be idle yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle();
                        if evicted > 0 {
                            tracing::info!(evicted, remaining = limiter.tracked_callers(), "idle_callers_evicted");
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("caller_sweeper_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallerId, RateLimitConfig};

    #[tokio::test]
    async fn test_sweeper_evicts_idle_callers() {
        let config = RateLimitConfig {
            caller_idle_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let limiter = Arc::new(RateLimiter::new(config));
        limiter
            .allow(Some(&CallerId::must("idle")), "analyzePosition")
            .unwrap();
        assert_eq!(limiter.tracked_callers(), 1);

        let mut sweeper = CallerSweeper::with_interval(limiter.clone(), Duration::from_millis(10));
        let handle = sweeper.start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(limiter.tracked_callers(), 0);

        sweeper.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let mut sweeper = CallerSweeper::new(limiter);
        let handle = sweeper.start();
        sweeper.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
