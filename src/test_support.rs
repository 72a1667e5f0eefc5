//! In-memory doubles for the store, ledger and loader seams.

use crate::error::StatementGroup;
use crate::events::{EventRecord, PersistedEvent};
use crate::fingerprint::Fingerprint;
use crate::ledger::{SourceLedger, SourceObject};
use crate::loader::{BatchLoader, FilterOp, Predicate, RawRecord};
use crate::store::{EventStore, TimestampUpdate};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

#[derive(Default)]
struct StoreInner {
    rows: BTreeMap<i64, EventRecord>,
    next_id: i64,
    fail_next: Option<StatementGroup>,
}

impl StoreInner {
    fn check_failure(&mut self, group: StatementGroup) -> Result<()> {
        if self.fail_next == Some(group) {
            self.fail_next = None;
            bail!("injected {group} failure");
        }
        Ok(())
    }
}

/// Event store with the same uniqueness rule as the SQL table.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn with_rows(rows: Vec<EventRecord>) -> Self {
        let store = Self::default();
        {
            let mut inner = store.inner.lock().expect("store lock");
            for event in rows {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.rows.insert(id, event);
            }
        }
        store
    }

    /// Make the next call of `group` fail without touching any row.
    pub fn fail_once(&self, group: StatementGroup) {
        self.inner.lock().expect("store lock").fail_next = Some(group);
    }

    pub fn persisted(&self) -> Vec<PersistedEvent> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .rows
            .iter()
            .map(|(id, event)| PersistedEvent {
                id: *id,
                event: event.clone(),
            })
            .collect()
    }

    /// Current rows without surrogate ids, sorted by fingerprint.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        let inner = self.inner.lock().expect("store lock");
        let mut rows: Vec<EventRecord> = inner.rows.values().cloned().collect();
        rows.sort_by_key(|e| e.fingerprint);
        rows
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn select_by_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<PersistedEvent>> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.check_failure(StatementGroup::Select)?;
        let wanted: HashSet<Fingerprint> = fingerprints.iter().copied().collect();
        Ok(inner
            .rows
            .iter()
            .filter(|(_, event)| wanted.contains(&event.fingerprint))
            .map(|(id, event)| PersistedEvent {
                id: *id,
                event: event.clone(),
            })
            .collect())
    }

    async fn update_timestamps(&self, updates: &[TimestampUpdate]) -> Result<u64> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.check_failure(StatementGroup::Update)?;
        let mut affected = 0;
        for update in updates {
            if let Some(row) = inner.rows.get_mut(&update.id) {
                row.timestamp_start = update.timestamp_start;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&self, ids: &[i64]) -> Result<u64> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.check_failure(StatementGroup::Delete)?;
        Ok(ids
            .iter()
            .filter(|id| inner.rows.remove(*id).is_some())
            .count() as u64)
    }

    async fn insert(&self, rows: &[EventRecord]) -> Result<u64> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.check_failure(StatementGroup::Insert)?;
        let mut seen: HashSet<Fingerprint> = inner.rows.values().map(|e| e.fingerprint).collect();
        for event in rows {
            if !seen.insert(event.fingerprint) {
                bail!(
                    "duplicate key value violates unique constraint on hash {}",
                    event.fingerprint
                );
            }
        }
        for event in rows {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.rows.insert(id, event.clone());
        }
        Ok(rows.len() as u64)
    }
}

#[derive(Default)]
struct LedgerInner {
    objects: Vec<(SourceObject, bool)>,
    fail_mark_once: bool,
    mark_calls: usize,
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn with_paths(paths: &[&str]) -> Self {
        let ledger = Self::default();
        {
            let mut inner = ledger.inner.lock().expect("ledger lock");
            for (idx, path) in paths.iter().enumerate() {
                let object = SourceObject {
                    id: idx as i64 + 1,
                    path: path.to_string(),
                };
                inner.objects.push((object, false));
            }
        }
        ledger
    }

    pub fn fail_next_mark(&self) {
        self.inner.lock().expect("ledger lock").fail_mark_once = true;
    }

    pub fn processed_paths(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("ledger lock");
        inner
            .objects
            .iter()
            .filter(|(_, processed)| *processed)
            .map(|(object, _)| object.path.clone())
            .collect()
    }

    pub fn mark_calls(&self) -> usize {
        self.inner.lock().expect("ledger lock").mark_calls
    }
}

#[async_trait]
impl SourceLedger for MemoryLedger {
    async fn list_unprocessed(&self, source_tag: &str) -> Result<Vec<SourceObject>> {
        let inner = self.inner.lock().expect("ledger lock");
        Ok(inner
            .objects
            .iter()
            .filter(|(object, processed)| !*processed && object.path.contains(source_tag))
            .map(|(object, _)| object.clone())
            .collect())
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        let mut inner = self.inner.lock().expect("ledger lock");
        inner.mark_calls += 1;
        if inner.fail_mark_once {
            inner.fail_mark_once = false;
            bail!("injected ledger failure");
        }
        let mut affected = 0;
        for (object, processed) in inner.objects.iter_mut() {
            if ids.contains(&object.id) && !*processed {
                *processed = true;
                affected += 1;
            }
        }
        Ok(affected)
    }
}

/// Serves pre-built rows per path and applies filters like a real loader.
#[derive(Default)]
pub struct MemoryLoader {
    files: HashMap<String, Vec<RawRecord>>,
    failing: HashSet<String>,
}

impl MemoryLoader {
    pub fn with_file(mut self, path: &str, rows: Vec<RawRecord>) -> Self {
        self.files.insert(path.to_string(), rows);
        self
    }

    pub fn with_failing_file(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }
}

#[async_trait]
impl BatchLoader for MemoryLoader {
    async fn load(
        &self,
        paths: &[String],
        columns: &[&str],
        filters: &[Predicate],
    ) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        for path in paths {
            if self.failing.contains(path) {
                return Err(anyhow!("object {path} unreadable"));
            }
            let rows = self.files.get(path).cloned().unwrap_or_default();
            for mut row in rows {
                if !filters.iter().all(|f| predicate_matches(f, &row)) {
                    continue;
                }
                if !columns.is_empty() {
                    row.retain(|key, _| columns.contains(&key.as_str()));
                }
                out.push(row);
            }
        }
        Ok(out)
    }
}

/// In-memory twin of `Predicate::to_sql`: an absent or null column never matches.
fn predicate_matches(predicate: &Predicate, record: &RawRecord) -> bool {
    let actual = record.get(&predicate.column).unwrap_or(&Value::Null);
    if actual.is_null() {
        return false;
    }
    match &predicate.op {
        FilterOp::NotEq(Value::Null) => true,
        FilterOp::NotEq(expected) => compare(actual, expected) != Some(Ordering::Equal),
        FilterOp::In(options) => options
            .iter()
            .any(|expected| compare(actual, expected) == Some(Ordering::Equal)),
        FilterOp::Gt(bound) => compare(actual, bound) == Some(Ordering::Greater),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Some(a.cmp(&b));
            }
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Write a trip-update parquet file with one Red line trip per row:
/// (message timestamp, stop id, arrival time, vehicle id).
pub fn write_trip_updates_parquet(
    path: &Path,
    rows: &[(i64, &str, Option<i64>, Option<&str>)],
) -> Result<()> {
    let values = rows
        .iter()
        .map(|(timestamp, stop_id, arrival, vehicle_id)| {
            let arrival = arrival.map_or("NULL".to_string(), |t| t.to_string());
            let vehicle_id = vehicle_id.map_or("NULL".to_string(), |v| format!("'{v}'"));
            format!(
                "({timestamp}::BIGINT, [{{'stop_id': '{stop_id}', 'stop_sequence': 1, 'arrival': {{'time': {arrival}::BIGINT}}}}], 0, 'Red', '20230508', '07:30:00', {vehicle_id}::VARCHAR)"
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");
    let sql = format!(
        r#"
        COPY (
            SELECT * FROM (VALUES {values})
                AS t("timestamp", stop_time_update, direction_id, route_id, start_date, start_time, vehicle_id)
        ) TO '{}' (FORMAT PARQUET)
        "#,
        path.display()
    );
    let conn = duckdb::Connection::open_in_memory()?;
    conn.execute_batch(&sql)?;
    Ok(())
}
