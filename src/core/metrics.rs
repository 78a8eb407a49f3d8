use metrics::{describe_counter, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::core::config::Settings;

/// Installs the Prometheus recorder with its scrape listener when enabled.
///
/// Without a recorder the `metrics::counter!` calls are no-ops.
pub fn init(settings: &Settings) -> anyhow::Result<()> {
    let telemetry = settings.telemetry();
    if !telemetry.prometheus_enabled {
        return Ok(());
    }

    PrometheusBuilder::new().with_http_listener(telemetry.prometheus_listen_addr).install()?;
    describe();
    tracing::info!(addr = %telemetry.prometheus_listen_addr, "Prometheus exporter listening");
    Ok(())
}

fn describe() {
    describe_counter!("attempts_started_total", Unit::Count, "Attempts opened");
    describe_counter!(
        "attempts_finished_total",
        Unit::Count,
        "Attempts moved to a terminal status, by status"
    );
    describe_counter!("attempts_timed_out_total", Unit::Count, "Attempts timed out by the sweeper");
    describe_counter!("answers_upserted_total", Unit::Count, "Answers created or resubmitted");
    describe_counter!("answers_graded_total", Unit::Count, "Answers graded by a reviewer");
    describe_counter!("cache_hits_total", Unit::Count, "Read-through cache hits");
    describe_counter!("cache_misses_total", Unit::Count, "Read-through cache misses");
    describe_counter!("cache_errors_total", Unit::Count, "Absorbed cache failures, by operation");
}
