use anyhow::{Context, Result};
use sqlx::PgPool;

const SCHEMA_STATEMENTS: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS trip_update_events (
        pk_id BIGSERIAL PRIMARY KEY,
        hash BYTEA NOT NULL UNIQUE,
        direction_id SMALLINT NOT NULL,
        route_id VARCHAR(60) NOT NULL,
        start_date INTEGER NOT NULL,
        start_time INTEGER NOT NULL,
        vehicle_id VARCHAR(60) NOT NULL,
        stop_id VARCHAR(60) NOT NULL,
        stop_sequence INTEGER NOT NULL,
        timestamp_start BIGINT NOT NULL,
        is_moving BOOLEAN NOT NULL DEFAULT false,
        updated_on TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metadata_log (
        pk_id BIGSERIAL PRIMARY KEY,
        processed BOOLEAN NOT NULL DEFAULT false,
        process_fail BOOLEAN NOT NULL DEFAULT false,
        path VARCHAR(256) NOT NULL UNIQUE,
        created_on TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS metadata_log_unprocessed_idx
        ON metadata_log (pk_id) WHERE processed = false
    "#,
];

/// Create the event and ledger tables when they are missing. Deployments
/// that manage migrations elsewhere leave this off.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("bootstrap trip-update-events schema")?;
    }
    tracing::info!("trip update schema ready");
    Ok(())
}

#[cfg(test)]
mod tests;
