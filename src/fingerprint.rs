//! Identity hash shared by the trip-update and vehicle-position event tables.
//!
//! Both pipelines must compute the fingerprint byte for byte the same way or the
//! downstream join between predicted and observed events silently drops rows.
//! The encoding is: the seven identity fields as UTF-8 text (integers in plain
//! base 10), joined with the ASCII unit separator `0x1F`, hashed with SHA-256,
//! truncated to the first 16 bytes.

use sha2::{Digest, Sha256};
use std::fmt;

pub const FINGERPRINT_LEN: usize = 16;
const FIELD_SEPARATOR: u8 = 0x1f;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; FINGERPRINT_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// The identity of one (trip, stop-visit) pair. Predicted arrival time is
/// deliberately absent.
#[derive(Clone, Copy, Debug)]
pub struct StopVisit<'a> {
    pub route_id: &'a str,
    pub direction_id: i16,
    pub start_date: i32,
    pub start_time: i32,
    pub vehicle_id: &'a str,
    pub stop_id: &'a str,
    pub stop_sequence: i32,
}

impl StopVisit<'_> {
    pub fn fingerprint(&self) -> Fingerprint {
        let direction_id = self.direction_id.to_string();
        let start_date = self.start_date.to_string();
        let start_time = self.start_time.to_string();
        let stop_sequence = self.stop_sequence.to_string();
        let fields: [&[u8]; 7] = [
            self.route_id.as_bytes(),
            direction_id.as_bytes(),
            start_date.as_bytes(),
            start_time.as_bytes(),
            self.vehicle_id.as_bytes(),
            self.stop_id.as_bytes(),
            stop_sequence.as_bytes(),
        ];

        let mut hasher = Sha256::new();
        for (idx, field) in fields.iter().enumerate() {
            if idx > 0 {
                hasher.update([FIELD_SEPARATOR]);
            }
            hasher.update(field);
        }
        let digest = hasher.finalize();

        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Fingerprint(out)
    }
}
