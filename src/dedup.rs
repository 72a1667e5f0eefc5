use crate::events::{CandidateEvent, EventRecord};

/// Collapse repeated observations of one stop-visit within a single pass.
///
/// Candidates are ordered by (fingerprint, source_timestamp) and the last
/// entry of each fingerprint group wins, so the most recently published
/// prediction survives. Ties keep input order. The output is sorted by
/// fingerprint and no longer carries the source timestamp.
pub fn dedup_latest(mut candidates: Vec<CandidateEvent>) -> Vec<EventRecord> {
    candidates.sort_by(|a, b| {
        a.event
            .fingerprint
            .cmp(&b.event.fingerprint)
            .then(a.source_timestamp.cmp(&b.source_timestamp))
    });

    let mut out: Vec<EventRecord> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match out.last_mut() {
            Some(last) if last.fingerprint == candidate.event.fingerprint => {
                *last = candidate.event;
            }
            _ => out.push(candidate.event),
        }
    }
    out
}
