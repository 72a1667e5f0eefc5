use crate::error::{ExtractionError, PipelineError};
use crate::events::{CandidateEvent, EventRecord, TripDescriptor};
use crate::loader::{Predicate, RawRecord};
use chrono::NaiveDate;
use serde_json::{json, Value};

pub const DEFAULT_PREDICTION_HORIZON_SECONDS: i64 = 120;

pub const TRIP_UPDATE_COLUMNS: [&str; 7] = [
    "timestamp",
    "stop_time_update",
    "direction_id",
    "route_id",
    "start_date",
    "start_time",
    "vehicle_id",
];

/// Row filters pushed down to the loader for trip-update batches.
pub fn trip_update_filters() -> Vec<Predicate> {
    vec![
        Predicate::is_in("direction_id", [json!(0), json!(1)]),
        Predicate::gt("timestamp", 0),
        Predicate::not_null("route_id"),
        Predicate::not_null("start_date"),
        Predicate::not_null("start_time"),
        Predicate::not_null("vehicle_id"),
    ]
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub rows: usize,
    pub predictions: usize,
    pub candidates: usize,
    pub no_estimate: usize,
    pub outside_horizon: usize,
    pub malformed: usize,
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub candidates: Vec<CandidateEvent>,
    pub stats: ExtractStats,
}

struct Prediction {
    stop_id: String,
    stop_sequence: i32,
    arrival: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct Extractor {
    horizon_seconds: i64,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(DEFAULT_PREDICTION_HORIZON_SECONDS)
    }
}

impl Extractor {
    pub fn new(horizon_seconds: i64) -> Self {
        Self {
            horizon_seconds: horizon_seconds.max(0),
        }
    }

    /// Flatten every (row, prediction) pair into near-term candidate events.
    ///
    /// Malformed or stale predictions are skipped one by one; a row whose trip
    /// descriptor cannot be coerced fails the whole call.
    pub fn extract(&self, rows: &[RawRecord]) -> Result<Extraction, PipelineError> {
        let mut out = Extraction::default();

        for row in rows {
            out.stats.rows += 1;
            let message_ts = coerce_column(row, "timestamp", coerce_i64)?;
            let trip = trip_descriptor(row)?;

            let predictions = match row.get("stop_time_update") {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => items,
                Some(other) => {
                    out.stats.malformed += 1;
                    tracing::debug!(
                        route = %trip.route_id,
                        vehicle = %trip.vehicle_id,
                        value = %other,
                        "skipping row with non-list stop_time_update"
                    );
                    continue;
                }
            };

            for raw in predictions {
                out.stats.predictions += 1;
                let Some(arrival) = raw.get("arrival").and_then(|a| a.get("time")) else {
                    out.stats.no_estimate += 1;
                    continue;
                };
                if arrival.is_null() {
                    out.stats.no_estimate += 1;
                    continue;
                }

                match self.parse_prediction(raw, arrival, message_ts) {
                    Ok(Some(prediction)) => {
                        out.stats.candidates += 1;
                        out.candidates.push(CandidateEvent {
                            event: EventRecord::new(
                                &trip,
                                prediction.stop_id,
                                prediction.stop_sequence,
                                prediction.arrival,
                            ),
                            source_timestamp: message_ts,
                        });
                    }
                    Ok(None) => out.stats.outside_horizon += 1,
                    Err(err) => {
                        out.stats.malformed += 1;
                        tracing::debug!(
                            route = %trip.route_id,
                            vehicle = %trip.vehicle_id,
                            error = %err,
                            "skipping malformed prediction"
                        );
                    }
                }
            }
        }

        Ok(out)
    }

    fn parse_prediction(
        &self,
        raw: &Value,
        arrival: &Value,
        message_ts: i64,
    ) -> Result<Option<Prediction>, ExtractionError> {
        let arrival = coerce_i64(arrival).ok_or_else(|| ExtractionError::InvalidField {
            field: "arrival.time",
            value: arrival.to_string(),
        })?;

        let lead = arrival.saturating_sub(message_ts);
        if !(0..=self.horizon_seconds).contains(&lead) {
            return Ok(None);
        }

        let stop_id = match raw.get("stop_id") {
            None | Some(Value::Null) => return Err(ExtractionError::MissingField("stop_id")),
            Some(value) => coerce_text(value).ok_or_else(|| ExtractionError::InvalidField {
                field: "stop_id",
                value: value.to_string(),
            })?,
        };
        let stop_sequence = match raw.get("stop_sequence") {
            None | Some(Value::Null) => {
                return Err(ExtractionError::MissingField("stop_sequence"))
            }
            Some(value) => coerce_i64(value)
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| ExtractionError::InvalidField {
                    field: "stop_sequence",
                    value: value.to_string(),
                })?,
        };

        Ok(Some(Prediction {
            stop_id,
            stop_sequence,
            arrival,
        }))
    }
}

fn trip_descriptor(row: &RawRecord) -> Result<TripDescriptor, PipelineError> {
    let direction_id = coerce_column(row, "direction_id", |value| {
        coerce_i64(value).filter(|v| *v == 0 || *v == 1)
    })?;
    Ok(TripDescriptor {
        route_id: coerce_column(row, "route_id", coerce_text)?,
        direction_id: direction_id as i16,
        start_date: coerce_column(row, "start_date", parse_start_date)?,
        start_time: coerce_column(row, "start_time", |value| {
            value.as_str().and_then(start_time_to_seconds)
        })?,
        vehicle_id: coerce_column(row, "vehicle_id", coerce_text)?,
    })
}

fn coerce_column<T>(
    row: &RawRecord,
    column: &'static str,
    coerce: impl FnOnce(&Value) -> Option<T>,
) -> Result<T, PipelineError> {
    let value = row.get(column).unwrap_or(&Value::Null);
    coerce(value).ok_or_else(|| PipelineError::TypeCoercion {
        column,
        value: value.to_string(),
    })
}

/// Integers, finite floats (truncated toward zero) and decimal strings.
fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `YYYYMMDD` given as text or integer; must name a real calendar day.
fn parse_start_date(value: &Value) -> Option<i32> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.as_i64()?.to_string(),
        _ => return None,
    };
    if text.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(&text, "%Y%m%d").ok()?;
    text.parse().ok()
}

/// Convert a GTFS `HH:MM:SS` start time into seconds after midnight of the
/// service day. Hours past 23 are valid for trips running after midnight.
pub fn start_time_to_seconds(text: &str) -> Option<i32> {
    let mut parts = text.trim().split(':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = parts.next()?.parse().ok()?;
    let seconds: i32 = parts.next()?.parse().ok()?;
    if parts.next().is_some()
        || hours < 0
        || !(0..60).contains(&minutes)
        || !(0..60).contains(&seconds)
    {
        return None;
    }
    hours.checked_mul(3600)?.checked_add(minutes * 60 + seconds)
}
