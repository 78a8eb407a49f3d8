use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::context::RequestContext;
use crate::core::redis::{RedisHandle, RedisHealth};
use crate::core::shutdown::{self, Shutdown};
use crate::core::state::AppState;
use crate::services::AttemptService;
use crate::store::PgStore;

const SWEEP_BATCH_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(state: AppState) -> Result<()> {
    let (shutdown, shutdown_rx) = Shutdown::new();
    let settings = state.settings().attempts().clone();

    let handles = vec![
        tokio::spawn(timeout_sweep_loop(
            state.attempts().clone(),
            Duration::from_secs(settings.sweep_interval_seconds.max(1)),
            settings.sweep_batch_size,
            shutdown_rx.clone(),
        )),
        tokio::spawn(health_loop(state.store().clone(), state.redis().clone(), shutdown_rx)),
    ];

    shutdown::shutdown_signal().await;
    shutdown.trigger();

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn timeout_sweep_loop(
    attempts: AttemptService,
    every: Duration,
    batch_size: u32,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown::requested(&mut shutdown_rx) => break,
            _ = tick.tick() => {
                let swept = sweep_until_drained(&attempts, batch_size).await;
                if swept > 0 {
                    tracing::info!(swept, "Timeout sweep finished");
                }
            }
        }
    }
}

/// Runs sweep batches until one comes back short or fails. Returns how many
/// attempts were timed out.
pub(crate) async fn sweep_until_drained(attempts: &AttemptService, batch_size: u32) -> usize {
    let batch_size = batch_size.max(1);
    let mut total = 0;
    loop {
        let ctx = RequestContext::new().with_timeout(SWEEP_BATCH_TIMEOUT);
        match attempts.sweep_timeouts(&ctx, i64::from(batch_size)).await {
            Ok(ids) => {
                total += ids.len();
                if ids.len() < batch_size as usize {
                    break;
                }
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    kind = err.kind(),
                    request_id = %ctx.request_id(),
                    "Timeout sweep failed"
                );
                break;
            }
        }
    }
    total
}

/// Pings Postgres and reconnects Redis when the cache has dropped away.
async fn health_loop(store: PgStore, redis: RedisHandle, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = interval(HEALTH_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown::requested(&mut shutdown_rx) => break,
            _ = tick.tick() => {
                if let Err(err) = store.ping().await {
                    tracing::error!(error = %err, "Database health check failed");
                }

                match redis.health().await {
                    RedisHealth::Healthy => {}
                    RedisHealth::Disconnected | RedisHealth::Unhealthy(_) => {
                        match redis.connect().await {
                            Ok(()) => tracing::info!("Redis reconnected"),
                            Err(err) => tracing::warn!(error = %err, "Redis still unavailable; cache bypassed"),
                        }
                    }
                }
            }
        }
    }
}
