//! Background eviction of idle keys.
//!
//! Without a sweep every distinct key a limiter ever sees stays in memory for
//! the life of the process. The sweeper periodically asks each registered
//! limiter to drop keys whose state can no longer influence a decision.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::limiter::RateLimiter;
use super::registry::LimiterRegistry;
use crate::config::EvictionConfig;
use crate::error::{Result, TurnstileError};

/// Handle to a running sweep task.
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// Policies added to the registry after spawning are picked up on the
    /// next sweep.
    pub fn spawn(registry: Arc<LimiterRegistry>, config: &EvictionConfig) -> Result<Self> {
        Self::spawn_with(registry, config.idle_after(), config.sweep_interval())
    }

    /// Spawn with explicit timings. `sweep_interval` must be non-zero.
    pub fn spawn_with(
        registry: Arc<LimiterRegistry>,
        idle_after: Duration,
        sweep_interval: Duration,
    ) -> Result<Self> {
        if sweep_interval.is_zero() {
            return Err(TurnstileError::Config(
                "eviction.sweep_interval_secs must be positive".to_string(),
            ));
        }

        let (tx, mut rx) = oneshot::channel();

        info!(
            idle_after_ms = idle_after.as_millis() as u64,
            sweep_interval_ms = sweep_interval.as_millis() as u64,
            "Starting idle key sweeper"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&registry, idle_after);
                    }
                    _ = &mut rx => {
                        debug!("Idle key sweeper stopping");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            shutdown: Some(tx),
            handle,
        })
    }

    /// Stop the loop and wait for it to finish.
    ///
    /// Returns an error if the sweep task died before it was asked to stop.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            error!(error = %e, "Idle key sweeper failed");
            return Err(e.into());
        }
        info!("Idle key sweeper stopped");
        Ok(())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.handle.abort();
        }
    }
}

/// Run one eviction pass over every limiter in `registry`. Returns the total removed.
pub fn sweep(registry: &LimiterRegistry, idle_after: Duration) -> usize {
    let mut total = 0;
    for (name, limiter) in registry.limiters() {
        let now = limiter.clock().now();
        let removed = limiter.evict_idle(now, idle_after);
        if removed > 0 {
            debug!(
                policy = %name,
                removed = removed,
                remaining = limiter.tracked_keys(),
                "Evicted idle keys"
            );
        }
        total += removed;
    }
    total
}
