mod config;
mod db;
mod dedup;
mod error;
mod events;
mod extract;
mod fingerprint;
mod ledger;
mod loader;
mod merge;
mod pipeline;
mod process_log;
mod store;

#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::pipeline::{build_pool, run_pg_cycle, spawn_worker, CycleStats};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,trip_update_events=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "trip-update-events"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    if config.bootstrap_schema {
        db::ensure_schema(&pool).await?;
    }
    let stats = Arc::new(CycleStats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.run_once {
        let report = run_pg_cycle(&pool, &config, &stats, &shutdown_rx).await?;
        let failed: Vec<&str> = report
            .outcomes
            .iter()
            .filter(|o| !o.is_processed())
            .map(|o| o.partition())
            .collect();
        tracing::info!(
            partitions = report.outcomes.len(),
            failed = failed.len(),
            skipped = report.skipped,
            "single trip update cycle finished"
        );
        for partition in failed {
            tracing::warn!(partition, "partition left unacknowledged");
        }
        stats.log_summary();
        return Ok(());
    }

    tracing::info!(
        source_tag = %config.source_tag,
        poll_interval_ms = config.poll_interval_ms,
        "trip update worker starting"
    );
    let worker_handle = spawn_worker(pool, config, stats, shutdown_rx);

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error=%err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received; finishing current partition");
    let _ = shutdown_tx.send(true);
    if let Err(err) = worker_handle.await {
        tracing::error!(error=%err, "trip update worker failed");
    }

    Ok(())
}
