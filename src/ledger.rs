use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceObject {
    pub id: i64,
    pub path: String,
}

/// Durable record of which source objects have been folded into the event
/// store. Marking happens only after a partition merged successfully.
#[async_trait]
pub trait SourceLedger: Send + Sync {
    async fn list_unprocessed(&self, source_tag: &str) -> Result<Vec<SourceObject>>;

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64>;
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceLedger for PgLedger {
    async fn list_unprocessed(&self, source_tag: &str) -> Result<Vec<SourceObject>> {
        let rows = sqlx::query(
            r#"
            SELECT pk_id, path
            FROM metadata_log
            WHERE processed = false
              AND strpos(path, $1) > 0
            ORDER BY pk_id
            "#,
        )
        .bind(source_tag)
        .fetch_all(&self.pool)
        .await
        .context("list unprocessed metadata_log rows")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SourceObject {
                id: row.try_get("pk_id")?,
                path: row.try_get("path")?,
            });
        }
        Ok(out)
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("UPDATE metadata_log SET processed = true WHERE pk_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .context("mark metadata_log rows processed")?;
        Ok(result.rows_affected())
    }
}
