use crate::events::{EventRecord, PersistedEvent};
use crate::fingerprint::Fingerprint;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

/// Postgres caps a statement at 65535 bind parameters; ten per row.
const INSERT_CHUNK_ROWS: usize = 4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampUpdate {
    pub id: i64,
    pub timestamp_start: i64,
}

/// Transactional access to the reconciled event table. Each write method is
/// atomic on its own; callers order them.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn select_by_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<PersistedEvent>>;

    async fn update_timestamps(&self, updates: &[TimestampUpdate]) -> Result<u64>;

    async fn delete(&self, ids: &[i64]) -> Result<u64>;

    async fn insert(&self, rows: &[EventRecord]) -> Result<u64>;
}

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn persisted_from_row(row: &PgRow) -> Result<PersistedEvent> {
    let hash: Vec<u8> = row.try_get("hash")?;
    let fingerprint = Fingerprint::from_slice(&hash)
        .ok_or_else(|| anyhow!("stored hash has {} bytes", hash.len()))?;

    Ok(PersistedEvent {
        id: row.try_get("pk_id")?,
        event: EventRecord {
            fingerprint,
            route_id: row.try_get("route_id")?,
            direction_id: row.try_get("direction_id")?,
            start_date: row.try_get("start_date")?,
            start_time: row.try_get("start_time")?,
            vehicle_id: row.try_get("vehicle_id")?,
            stop_id: row.try_get("stop_id")?,
            stop_sequence: row.try_get("stop_sequence")?,
            timestamp_start: row.try_get("timestamp_start")?,
            is_moving: row.try_get("is_moving")?,
        },
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn select_by_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<PersistedEvent>> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        let hashes: Vec<Vec<u8>> = fingerprints.iter().map(|fp| fp.as_bytes().to_vec()).collect();

        let rows = sqlx::query(
            r#"
            SELECT
                pk_id,
                hash,
                direction_id,
                route_id,
                start_date,
                start_time,
                vehicle_id,
                stop_id,
                stop_sequence,
                timestamp_start,
                is_moving
            FROM trip_update_events
            WHERE hash = ANY($1)
            "#,
        )
        .bind(hashes)
        .fetch_all(&self.pool)
        .await
        .context("select trip_update_events by hash")?;

        rows.iter().map(persisted_from_row).collect()
    }

    async fn update_timestamps(&self, updates: &[TimestampUpdate]) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = updates.iter().map(|u| u.id).collect();
        let timestamps: Vec<i64> = updates.iter().map(|u| u.timestamp_start).collect();

        let result = sqlx::query(
            r#"
            UPDATE trip_update_events AS e
            SET timestamp_start = u.timestamp_start,
                updated_on = NOW()
            FROM UNNEST($1::bigint[], $2::bigint[]) AS u(pk_id, timestamp_start)
            WHERE e.pk_id = u.pk_id
            "#,
        )
        .bind(ids)
        .bind(timestamps)
        .execute(&self.pool)
        .await
        .context("update trip_update_events timestamps")?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM trip_update_events WHERE pk_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .context("delete superseded trip_update_events")?;
        Ok(result.rows_affected())
    }

    async fn insert(&self, rows: &[EventRecord]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO trip_update_events (hash, direction_id, route_id, start_date, start_time, vehicle_id, stop_id, stop_sequence, timestamp_start, is_moving) ",
            );
            builder.push_values(chunk.iter(), |mut b, event| {
                b.push_bind(event.fingerprint.as_bytes())
                    .push_bind(event.direction_id)
                    .push_bind(&event.route_id)
                    .push_bind(event.start_date)
                    .push_bind(event.start_time)
                    .push_bind(&event.vehicle_id)
                    .push_bind(&event.stop_id)
                    .push_bind(event.stop_sequence)
                    .push_bind(event.timestamp_start)
                    .push_bind(event.is_moving);
            });
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .context("insert trip_update_events")?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}
