use crate::fingerprint::{Fingerprint, StopVisit};

/// Trip descriptor columns of one trip-update row after type coercion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TripDescriptor {
    pub route_id: String,
    pub direction_id: i16,
    pub start_date: i32,
    pub start_time: i32,
    pub vehicle_id: String,
}

/// Semantic content of a predicted stop event, shared by the ephemeral and
/// persisted variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub fingerprint: Fingerprint,
    pub route_id: String,
    pub direction_id: i16,
    pub start_date: i32,
    pub start_time: i32,
    pub vehicle_id: String,
    pub stop_id: String,
    pub stop_sequence: i32,
    pub timestamp_start: i64,
    /// Always false for predictions. Vehicle-position rows sharing the table
    /// layout set it while the vehicle is between stops.
    pub is_moving: bool,
}

impl EventRecord {
    pub fn new(
        trip: &TripDescriptor,
        stop_id: String,
        stop_sequence: i32,
        timestamp_start: i64,
    ) -> Self {
        let fingerprint = StopVisit {
            route_id: &trip.route_id,
            direction_id: trip.direction_id,
            start_date: trip.start_date,
            start_time: trip.start_time,
            vehicle_id: &trip.vehicle_id,
            stop_id: &stop_id,
            stop_sequence,
        }
        .fingerprint();

        Self {
            fingerprint,
            route_id: trip.route_id.clone(),
            direction_id: trip.direction_id,
            start_date: trip.start_date,
            start_time: trip.start_time,
            vehicle_id: trip.vehicle_id.clone(),
            stop_id,
            stop_sequence,
            timestamp_start,
            is_moving: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip() -> TripDescriptor {
        TripDescriptor {
            route_id: "Red".to_string(),
            direction_id: 0,
            start_date: 20230508,
            start_time: 27000,
            vehicle_id: "R-547A".to_string(),
        }
    }

    #[test]
    fn fingerprint_ignores_predicted_arrival() {
        let early = EventRecord::new(&trip(), "70061".to_string(), 1, 1_683_540_000);
        let late = EventRecord::new(&trip(), "70061".to_string(), 1, 1_683_543_600);

        assert_eq!(early.fingerprint, late.fingerprint);
        assert_ne!(early.timestamp_start, late.timestamp_start);
    }

    #[test]
    fn predictions_are_stop_events() {
        let event = EventRecord::new(&trip(), "70061".to_string(), 1, 1_683_540_000);
        assert!(!event.is_moving);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateEvent {
    pub event: EventRecord,
    /// Feed message time. Only orders repeated observations inside one pass.
    pub source_timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedEvent {
    pub id: i64,
    pub event: EventRecord,
}
