use crate::config::Config;
use crate::dedup::dedup_latest;
use crate::error::PipelineError;
use crate::extract::{trip_update_filters, Extractor, TRIP_UPDATE_COLUMNS};
use crate::ledger::{PgLedger, SourceLedger, SourceObject};
use crate::loader::{BatchLoader, ParquetLoader};
use crate::merge::{merge_events, MergeReport};
use crate::process_log::ProcessLog;
use crate::store::{EventStore, PgEventStore};
use anyhow::Result;
use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Source objects sharing a parent folder. Merged and acknowledged as a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub key: String,
    pub ids: Vec<i64>,
    pub paths: Vec<String>,
}

pub fn group_partitions(objects: Vec<SourceObject>) -> Vec<Partition> {
    let mut grouped: BTreeMap<String, Partition> = BTreeMap::new();
    for object in objects {
        let key = Path::new(&object.path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partition = grouped.entry(key.clone()).or_insert_with(|| Partition {
            key,
            ids: Vec::new(),
            paths: Vec::new(),
        });
        partition.ids.push(object.id);
        partition.paths.push(object.path);
    }
    grouped.into_values().collect()
}

#[derive(Debug)]
pub enum PartitionOutcome {
    Processed {
        partition: String,
        objects: usize,
        report: MergeReport,
    },
    /// Nothing was acknowledged; the whole partition is retried next cycle.
    Failed {
        partition: String,
        objects: usize,
        error: PipelineError,
    },
    /// The merge committed but the ledger write did not. Reprocessing is safe.
    LedgerNotUpdated {
        partition: String,
        objects: usize,
        report: MergeReport,
        error: PipelineError,
    },
}

impl PartitionOutcome {
    pub fn partition(&self) -> &str {
        match self {
            PartitionOutcome::Processed { partition, .. }
            | PartitionOutcome::Failed { partition, .. }
            | PartitionOutcome::LedgerNotUpdated { partition, .. } => partition,
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, PartitionOutcome::Processed { .. })
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<PartitionOutcome>,
    /// Partitions left for the next cycle because shutdown was requested.
    pub skipped: usize,
}

#[derive(Debug)]
pub struct CycleStats {
    pub cycles: AtomicU64,
    pub partitions_processed: AtomicU64,
    pub partitions_failed: AtomicU64,
    pub events_updated: AtomicU64,
    pub events_deleted: AtomicU64,
    pub events_inserted: AtomicU64,
    pub last_cycle_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl CycleStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            partitions_processed: AtomicU64::new(0),
            partitions_failed: AtomicU64::new(0),
            events_updated: AtomicU64::new(0),
            events_deleted: AtomicU64::new(0),
            events_inserted: AtomicU64::new(0),
            last_cycle_unix_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn summary(&self) -> StatsSummary {
        let last_error = self.last_error.lock().ok().and_then(|e| e.clone());
        StatsSummary {
            cycles: self.cycles.load(Ordering::Relaxed),
            partitions_processed: self.partitions_processed.load(Ordering::Relaxed),
            partitions_failed: self.partitions_failed.load(Ordering::Relaxed),
            events_updated: self.events_updated.load(Ordering::Relaxed),
            events_deleted: self.events_deleted.load(Ordering::Relaxed),
            events_inserted: self.events_inserted.load(Ordering::Relaxed),
            last_cycle_unix_ms: self.last_cycle_unix_ms.load(Ordering::Relaxed),
            last_error,
        }
    }

    /// Emit the running totals as one structured line.
    pub fn log_summary(&self) {
        let summary = self.summary();
        tracing::info!(
            cycles = summary.cycles,
            partitions_processed = summary.partitions_processed,
            partitions_failed = summary.partitions_failed,
            events_updated = summary.events_updated,
            events_deleted = summary.events_deleted,
            events_inserted = summary.events_inserted,
            last_cycle_unix_ms = summary.last_cycle_unix_ms,
            last_error = summary.last_error.as_deref().unwrap_or_default(),
            "trip update worker stats"
        );
    }

    fn record_merge(&self, report: &MergeReport) {
        self.events_updated.fetch_add(report.updated, Ordering::Relaxed);
        self.events_deleted.fetch_add(report.deleted, Ordering::Relaxed);
        self.events_inserted.fetch_add(report.inserted, Ordering::Relaxed);
    }

    fn record_cycle(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_cycle_unix_ms.store(now, Ordering::Relaxed);

        let mut last_error = None;
        for outcome in &report.outcomes {
            match outcome {
                PartitionOutcome::Processed { report, .. } => {
                    self.partitions_processed.fetch_add(1, Ordering::Relaxed);
                    self.record_merge(report);
                }
                PartitionOutcome::LedgerNotUpdated { report, error, .. } => {
                    self.partitions_failed.fetch_add(1, Ordering::Relaxed);
                    self.record_merge(report);
                    last_error = Some(error.to_string());
                }
                PartitionOutcome::Failed { error, .. } => {
                    self.partitions_failed.fetch_add(1, Ordering::Relaxed);
                    last_error = Some(error.to_string());
                }
            }
        }
        match last_error {
            Some(err) => self.record_error(err),
            None => self.clear_error(),
        }
    }
}

/// Point-in-time copy of [`CycleStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub cycles: u64,
    pub partitions_processed: u64,
    pub partitions_failed: u64,
    pub events_updated: u64,
    pub events_deleted: u64,
    pub events_inserted: u64,
    pub last_cycle_unix_ms: u64,
    pub last_error: Option<String>,
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One invocation's view of the collaborators. Holds no state of its own.
pub struct TripUpdatePipeline<'a> {
    pub ledger: &'a dyn SourceLedger,
    pub loader: &'a dyn BatchLoader,
    pub store: &'a dyn EventStore,
    pub extractor: Extractor,
    pub source_tag: &'a str,
}

impl TripUpdatePipeline<'_> {
    /// Process every unacknowledged partition once, sequentially. Shutdown is
    /// honoured between partitions only.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport> {
        let objects = self.ledger.list_unprocessed(self.source_tag).await?;
        let partitions = group_partitions(objects);
        tracing::info!(
            source_tag = self.source_tag,
            partitions = partitions.len(),
            "found unprocessed trip update partitions"
        );

        let mut report = CycleReport::default();
        for (idx, partition) in partitions.iter().enumerate() {
            if *shutdown.borrow() {
                report.skipped = partitions.len() - idx;
                tracing::info!(
                    skipped = report.skipped,
                    "shutdown requested; leaving partitions for next run"
                );
                break;
            }
            report.outcomes.push(self.process_partition(partition).await);
        }
        Ok(report)
    }

    pub async fn process_partition(&self, partition: &Partition) -> PartitionOutcome {
        let objects = partition.ids.len();
        let mut log = ProcessLog::new("process_trip_updates_partition")
            .with("partition", &partition.key)
            .with("objects", objects);
        log.start();

        let report = match self.load_and_merge(partition).await {
            Ok(report) => report,
            Err(error) => {
                log.fail(error.kind(), &error);
                tracing::warn!(
                    partition = %partition.key,
                    objects,
                    error = %error,
                    "trip update partition failed; will retry next cycle"
                );
                return PartitionOutcome::Failed {
                    partition: partition.key.clone(),
                    objects,
                    error,
                };
            }
        };

        if let Err(err) = self.ledger.mark_processed(&partition.ids).await {
            let error = PipelineError::Ledger(err);
            log.fail(error.kind(), &error);
            tracing::error!(
                partition = %partition.key,
                objects,
                error = %error,
                "merge committed but ledger update failed; partition will be reprocessed"
            );
            return PartitionOutcome::LedgerNotUpdated {
                partition: partition.key.clone(),
                objects,
                report,
                error,
            };
        }

        log.add_metadata("candidates", report.candidates);
        log.add_metadata("persisted", report.persisted_matches);
        log.add_metadata("updated", report.updated);
        log.add_metadata("deleted", report.deleted);
        log.add_metadata("inserted", report.inserted);
        log.complete();
        PartitionOutcome::Processed {
            partition: partition.key.clone(),
            objects,
            report,
        }
    }

    async fn load_and_merge(&self, partition: &Partition) -> Result<MergeReport, PipelineError> {
        let rows = self
            .loader
            .load(&partition.paths, &TRIP_UPDATE_COLUMNS, &trip_update_filters())
            .await
            .map_err(PipelineError::Load)?;

        let extraction = self.extractor.extract(&rows)?;
        let stats = extraction.stats;
        tracing::debug!(
            partition = %partition.key,
            rows = stats.rows,
            predictions = stats.predictions,
            candidates = stats.candidates,
            no_estimate = stats.no_estimate,
            outside_horizon = stats.outside_horizon,
            malformed = stats.malformed,
            "extracted trip update candidates"
        );

        let deduped = dedup_latest(extraction.candidates);
        merge_events(self.store, deduped).await
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run one cycle against Postgres-backed collaborators built for this
/// invocation only.
pub async fn run_pg_cycle(
    pool: &PgPool,
    config: &Config,
    stats: &CycleStats,
    shutdown: &watch::Receiver<bool>,
) -> Result<CycleReport> {
    let ledger = PgLedger::new(pool.clone());
    let store = PgEventStore::new(pool.clone());
    let loader = ParquetLoader::new(&config.batch_root);
    let pipeline = TripUpdatePipeline {
        ledger: &ledger,
        loader: &loader,
        store: &store,
        extractor: Extractor::new(config.prediction_horizon_seconds),
        source_tag: &config.source_tag,
    };

    let mut log = ProcessLog::new("process_trip_updates").with("source_tag", &config.source_tag);
    log.start();
    match pipeline.run_cycle(shutdown).await {
        Ok(report) => {
            stats.record_cycle(&report);
            log.add_metadata("partitions", report.outcomes.len());
            log.add_metadata(
                "failed",
                report.outcomes.iter().filter(|o| !o.is_processed()).count(),
            );
            log.complete();
            Ok(report)
        }
        Err(err) => {
            stats.record_error(err.to_string());
            log.fail("ledger", &err);
            Err(err)
        }
    }
}

/// Poll on a fixed interval until shutdown. A cycle in progress finishes its
/// current partition before the worker exits.
pub fn spawn_worker(
    pool: PgPool,
    config: Config,
    stats: Arc<CycleStats>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = run_pg_cycle(&pool, &config, &stats, &shutdown).await {
                        tracing::warn!(error=%err, "trip update cycle failed");
                    }
                    stats.log_summary();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("trip update worker stopped");
    })
}
