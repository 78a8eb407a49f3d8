pub mod cache;
pub mod core;
pub mod db;
pub(crate) mod repositories;
pub mod services;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod test_support;

use anyhow::Context;

use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::store::PgStore;

/// Runs the attempt worker until a shutdown signal arrives.
pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await.context("Failed to connect to Postgres")?;
    db::run_migrations(&db_pool).await.context("Failed to run migrations")?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; continuing without cache");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let state = AppState::new(settings, PgStore::new(db_pool), redis.clone());
    tracing::info!(
        environment = state.settings().runtime().environment.as_str(),
        sweep_interval_seconds = state.settings().attempts().sweep_interval_seconds,
        sweep_batch_size = state.settings().attempts().sweep_batch_size,
        "Attempt worker started"
    );

    let result = tasks::scheduler::run(state).await;

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result
}
