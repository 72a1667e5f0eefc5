use super::ensure_schema;
use crate::config::Config;
use crate::extract::DEFAULT_PREDICTION_HORIZON_SECONDS;
use crate::pipeline::{run_pg_cycle, CycleStats};
use crate::test_support::write_trip_updates_parquet;
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::path::Path;
use tokio::sync::watch;

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    ensure_schema(&pool).await?;
    Ok(pool)
}

async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin_pool)
        .await;
    Ok(())
}

fn write_batch(root: &Path, relative: &str, rows: &[(i64, &str, i64)]) -> Result<()> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rows: Vec<_> = rows
        .iter()
        .map(|(message_ts, stop_id, arrival)| {
            (*message_ts, *stop_id, Some(*arrival), Some("R-547A"))
        })
        .collect();
    write_trip_updates_parquet(&path, &rows)
}

fn test_config(database_url: &str, root: &Path) -> Config {
    Config {
        database_url: database_url.to_string(),
        db_pool_size: 5,
        source_tag: "RT_TRIP_UPDATES".to_string(),
        batch_root: root.to_path_buf(),
        prediction_horizon_seconds: DEFAULT_PREDICTION_HORIZON_SECONDS,
        poll_interval_ms: 25,
        run_once: true,
        bootstrap_schema: true,
        otlp_endpoint: None,
    }
}

#[tokio::test]
async fn test_cycle_merges_partitions_into_postgres() -> Result<()> {
    if env::var("TU_EVENTS_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return Ok(());
    }
    let database_url = match env::var("TU_EVENTS_TEST_DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };

    let schema = format!("tu_events_test_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let dir = tempfile::tempdir()?;

    let first = "lake/RT_TRIP_UPDATES/year=2023/month=5/day=8/hour=11/a.parquet";
    let second = "lake/RT_TRIP_UPDATES/year=2023/month=5/day=8/hour=11/b.parquet";
    let other_feed = "lake/RT_VEHICLE_POSITIONS/year=2023/month=5/day=8/hour=11/a.parquet";
    write_batch(
        dir.path(),
        first,
        &[(20, "A", 50), (60, "A", 80)],
    )?;
    write_batch(dir.path(), second, &[(100, "B", 200)])?;

    for path in [first, second, other_feed] {
        sqlx::query("INSERT INTO metadata_log (path) VALUES ($1)")
            .bind(format!("s3://{path}"))
            .execute(&pool)
            .await?;
    }

    let config = test_config(&database_url, dir.path());
    let stats = CycleStats::new();
    let (_tx, rx) = watch::channel(false);

    let report = run_pg_cycle(&pool, &config, &stats, &rx).await?;
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.outcomes[0].is_processed());

    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT stop_id, timestamp_start FROM trip_update_events ORDER BY stop_id",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(rows, vec![("A".to_string(), 80), ("B".to_string(), 200)]);
    let moving: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM trip_update_events WHERE is_moving")
            .fetch_one(&pool)
            .await?;
    assert_eq!(moving, 0);

    let unprocessed: Vec<String> =
        sqlx::query_scalar("SELECT path FROM metadata_log WHERE processed = false")
            .fetch_all(&pool)
            .await?;
    assert_eq!(unprocessed, vec![format!("s3://{other_feed}")]);

    // A later partition with a newer estimate updates the existing row in place.
    let third = "lake/RT_TRIP_UPDATES/year=2023/month=5/day=8/hour=12/a.parquet";
    write_batch(dir.path(), third, &[(150, "A", 240)])?;
    sqlx::query("INSERT INTO metadata_log (path) VALUES ($1)")
        .bind(format!("s3://{third}"))
        .execute(&pool)
        .await?;
    let id_before: i64 =
        sqlx::query_scalar("SELECT pk_id FROM trip_update_events WHERE stop_id = 'A'")
            .fetch_one(&pool)
            .await?;

    let report = run_pg_cycle(&pool, &config, &stats, &rx).await?;
    assert!(report.outcomes[0].is_processed());
    let (id_after, ts_after): (i64, i64) = sqlx::query_as(
        "SELECT pk_id, timestamp_start FROM trip_update_events WHERE stop_id = 'A'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(id_after, id_before);
    assert_eq!(ts_after, 240);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trip_update_events")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 2);

    drop_schema(&database_url, &schema).await?;
    Ok(())
}
