use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use duckdb::Connection;
use serde_json::Value;
use std::path::PathBuf;

/// One loosely typed batch row, keyed by column name.
pub type RawRecord = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum FilterOp {
    /// `NotEq(Value::Null)` keeps rows where the column is present and non-null.
    NotEq(Value),
    In(Vec<Value>),
    Gt(Value),
}

/// Column predicate pushed down to the parquet scan so rejected rows never
/// reach the extractor.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: FilterOp,
}

impl Predicate {
    pub fn not_null(column: &str) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::NotEq(Value::Null),
        }
    }

    pub fn is_in(column: &str, values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::In(values.into_iter().collect()),
        }
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Gt(value.into()),
        }
    }

    /// Render as a DuckDB boolean expression. Null columns never match.
    pub fn to_sql(&self) -> Result<String> {
        let column = quote_ident(&self.column);
        let sql = match &self.op {
            FilterOp::NotEq(Value::Null) => format!("{column} IS NOT NULL"),
            FilterOp::NotEq(value) => {
                format!("{column} IS NOT NULL AND {column} <> {}", sql_literal(value)?)
            }
            FilterOp::In(values) if values.is_empty() => "false".to_string(),
            FilterOp::In(values) => {
                let options = values
                    .iter()
                    .map(sql_literal)
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                format!("{column} IN ({options})")
            }
            FilterOp::Gt(value) => format!("{column} > {}", sql_literal(value)?),
        };
        Ok(sql)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_single_quotes(input: &str) -> String {
    input.replace('\'', "''")
}

fn sql_literal(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(format!("'{}'", escape_single_quotes(s))),
        other => bail!("unsupported filter literal {other}"),
    }
}

#[async_trait]
pub trait BatchLoader: Send + Sync {
    /// Load every row of `paths`, keep only `columns` (all columns when empty)
    /// and drop rows failing any of `filters`.
    async fn load(
        &self,
        paths: &[String],
        columns: &[&str],
        filters: &[Predicate],
    ) -> Result<Vec<RawRecord>>;
}

/// Reads parquet batch files with DuckDB. Ledger paths may carry an `s3://`
/// scheme; it is stripped and the rest is resolved beneath `root`, where the
/// bucket is mounted or synced.
#[derive(Clone, Debug)]
pub struct ParquetLoader {
    root: PathBuf,
}

impl ParquetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let trimmed = path.strip_prefix("s3://").unwrap_or(path);
        self.root.join(trimmed)
    }
}

/// Each row comes back as one JSON object so nested `stop_time_update`
/// structs keep their shape.
fn build_scan_sql(files: &[PathBuf], columns: &[&str], filters: &[Predicate]) -> Result<String> {
    let files_sql = files
        .iter()
        .map(|p| format!("'{}'", escape_single_quotes(&p.display().to_string())))
        .collect::<Vec<_>>()
        .join(", ");
    let columns_sql = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let where_sql = if filters.is_empty() {
        "true".to_string()
    } else {
        filters
            .iter()
            .map(|f| f.to_sql().map(|sql| format!("({sql})")))
            .collect::<Result<Vec<_>>>()?
            .join(" AND ")
    };

    Ok(format!(
        r#"
        SELECT to_json(batch)::VARCHAR
        FROM (
            SELECT {columns_sql}
            FROM read_parquet([{files_sql}], hive_partitioning=1, union_by_name=1)
            WHERE {where_sql}
        ) AS batch
        "#
    ))
}

#[async_trait]
impl BatchLoader for ParquetLoader {
    async fn load(
        &self,
        paths: &[String],
        columns: &[&str],
        filters: &[Predicate],
    ) -> Result<Vec<RawRecord>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let files: Vec<PathBuf> = paths.iter().map(|p| self.resolve(p)).collect();
        let sql = build_scan_sql(&files, columns, filters)?;

        tokio::task::spawn_blocking(move || -> Result<Vec<RawRecord>> {
            let conn = Connection::open_in_memory()?;
            let _ = conn.execute("PRAGMA threads=2", []);
            let _ = conn.execute("PRAGMA enable_progress_bar=false", []);

            let mut stmt = conn
                .prepare(&sql)
                .with_context(|| format!("scan {} parquet file(s)", files.len()))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let text: String = row.get(0)?;
                let record: RawRecord =
                    serde_json::from_str(&text).context("decode parquet row")?;
                out.push(record);
            }
            tracing::debug!(files = files.len(), rows = out.len(), "loaded parquet batch");
            Ok(out)
        })
        .await
        .context("parquet loader task panicked")?
    }
}
