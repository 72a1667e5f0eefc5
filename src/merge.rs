//! Reconciliation of freshly extracted events with rows already persisted.
//!
//! Persisted rows and candidates are concatenated and sorted by
//! (fingerprint, timestamp_start). Each run of equal fingerprints collapses
//! to one row holding the latest timestamp of the run. When the run contains
//! a persisted row, that row survives: it keeps its surrogate id, is updated
//! to the latest timestamp, and absorbs every fresh row of the run. Only runs
//! made entirely of fresh rows produce an insert. Extra persisted rows of a
//! run are deleted.
//!
//! No run ever needs a delete and an insert together, so a failure between
//! statement groups leaves each stop-visit with a row that a retry converges
//! from.

use crate::error::{PipelineError, StatementGroup};
use crate::events::{EventRecord, PersistedEvent};
use crate::fingerprint::Fingerprint;
use crate::store::{EventStore, TimestampUpdate};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub updates: Vec<TimestampUpdate>,
    pub deletes: Vec<i64>,
    pub inserts: Vec<EventRecord>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty() && self.inserts.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub candidates: usize,
    pub persisted_matches: usize,
    pub updated: u64,
    pub deleted: u64,
    pub inserted: u64,
}

struct MergeRow {
    id: Option<i64>,
    event: EventRecord,
}

/// Open run of rows sharing one fingerprint while scanning the sorted input.
struct Run {
    fingerprint: Fingerprint,
    len: usize,
    latest: i64,
    survivor: Option<i64>,
    extra_persisted: Vec<i64>,
    first_fresh: Option<EventRecord>,
}

impl Run {
    fn start(row: MergeRow) -> Self {
        let mut run = Self {
            fingerprint: row.event.fingerprint,
            len: 0,
            latest: row.event.timestamp_start,
            survivor: None,
            extra_persisted: Vec::new(),
            first_fresh: None,
        };
        run.push(row);
        run
    }

    fn push(&mut self, row: MergeRow) {
        self.len += 1;
        self.latest = self.latest.max(row.event.timestamp_start);
        match row.id {
            // Lowest id survives so retries settle on the same row.
            Some(id) => match self.survivor.take() {
                Some(current) if current < id => {
                    self.survivor = Some(current);
                    self.extra_persisted.push(id);
                }
                Some(current) => {
                    self.extra_persisted.push(current);
                    self.survivor = Some(id);
                }
                None => self.survivor = Some(id),
            },
            None => {
                if self.first_fresh.is_none() {
                    self.first_fresh = Some(row.event);
                }
            }
        }
    }

    fn close(self, plan: &mut MergePlan) {
        match (self.survivor, self.first_fresh) {
            (Some(id), _) => {
                if self.len > 1 {
                    plan.updates.push(TimestampUpdate {
                        id,
                        timestamp_start: self.latest,
                    });
                }
                plan.deletes.extend(self.extra_persisted);
            }
            (None, Some(mut event)) => {
                event.timestamp_start = self.latest;
                plan.inserts.push(event);
            }
            (None, None) => {}
        }
    }
}

pub fn plan_merge(persisted: Vec<PersistedEvent>, candidates: Vec<EventRecord>) -> MergePlan {
    let mut rows: Vec<MergeRow> = persisted
        .into_iter()
        .map(|p| MergeRow {
            id: Some(p.id),
            event: p.event,
        })
        .chain(candidates.into_iter().map(|event| MergeRow { id: None, event }))
        .collect();
    rows.sort_by(|a, b| {
        a.event
            .fingerprint
            .cmp(&b.event.fingerprint)
            .then(a.event.timestamp_start.cmp(&b.event.timestamp_start))
    });

    let mut plan = MergePlan::default();
    let mut current: Option<Run> = None;
    for row in rows {
        match current.as_mut() {
            Some(run) if run.fingerprint == row.event.fingerprint => run.push(row),
            _ => {
                if let Some(run) = current.take() {
                    run.close(&mut plan);
                }
                current = Some(Run::start(row));
            }
        }
    }
    if let Some(run) = current {
        run.close(&mut plan);
    }
    plan
}

/// Apply a plan as three independently atomic statement groups: UPDATE,
/// DELETE, INSERT. The first failure stops the remaining groups.
pub async fn apply_merge<S: EventStore + ?Sized>(
    store: &S,
    plan: &MergePlan,
) -> Result<MergeReport, PipelineError> {
    let mut report = MergeReport::default();

    if !plan.updates.is_empty() {
        report.updated = store
            .update_timestamps(&plan.updates)
            .await
            .map_err(|err| PipelineError::merge(StatementGroup::Update, err))?;
        tracing::info!(
            group = %StatementGroup::Update,
            rows = report.updated,
            "applied statement group"
        );
    }
    if !plan.deletes.is_empty() {
        report.deleted = store
            .delete(&plan.deletes)
            .await
            .map_err(|err| PipelineError::merge(StatementGroup::Delete, err))?;
        tracing::info!(
            group = %StatementGroup::Delete,
            rows = report.deleted,
            "applied statement group"
        );
    }
    if !plan.inserts.is_empty() {
        report.inserted = store
            .insert(&plan.inserts)
            .await
            .map_err(|err| PipelineError::merge(StatementGroup::Insert, err))?;
        tracing::info!(
            group = %StatementGroup::Insert,
            rows = report.inserted,
            "applied statement group"
        );
    }

    Ok(report)
}

/// Merge deduplicated candidates of one partition into the store.
pub async fn merge_events<S: EventStore + ?Sized>(
    store: &S,
    candidates: Vec<EventRecord>,
) -> Result<MergeReport, PipelineError> {
    if candidates.is_empty() {
        return Ok(MergeReport::default());
    }
    let candidate_count = candidates.len();
    let fingerprints: Vec<Fingerprint> = candidates.iter().map(|e| e.fingerprint).collect();
    let persisted = store
        .select_by_fingerprints(&fingerprints)
        .await
        .map_err(|err| PipelineError::merge(StatementGroup::Select, err))?;
    let persisted_matches = persisted.len();

    let plan = plan_merge(persisted, candidates);
    tracing::info!(
        candidates = candidate_count,
        persisted = persisted_matches,
        update = plan.updates.len(),
        delete = plan.deletes.len(),
        insert = plan.inserts.len(),
        "planned trip update merge"
    );

    if plan.is_empty() {
        return Ok(MergeReport {
            candidates: candidate_count,
            persisted_matches,
            ..MergeReport::default()
        });
    }
    let mut report = apply_merge(store, &plan).await?;
    report.candidates = candidate_count;
    report.persisted_matches = persisted_matches;
    Ok(report)
}
