//! Audit event model and hash computation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use simbridge_core::{time, EventId};

use crate::canonical::{to_canonical_bytes, CanonicalJsonError};

/// `prev_hash` of the very first event in a chain.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A single sealed entry of the audit chain.
///
/// `hash` is the SHA-256 (lowercase hex) of the canonical JSON encoding of
/// every other field. `prev_hash` is the `hash` of the preceding event, or
/// [`ZERO_HASH`] for the first event ever written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct HashInput<'a> {
    event_id: &'a EventId,
    timestamp: String,
    event_type: &'a str,
    payload: &'a Value,
    prev_hash: &'a str,
}

impl AuditEvent {
    /// Build a new event linked to `prev_hash` and compute its digest.
    pub fn seal(
        event_id: EventId,
        timestamp: DateTime<Utc>,
        event_type: impl Into<String>,
        payload: Value,
        prev_hash: impl Into<String>,
    ) -> Result<Self, CanonicalJsonError> {
        let mut event = Self {
            event_id,
            timestamp: time::truncate(timestamp),
            event_type: event_type.into(),
            payload,
            prev_hash: prev_hash.into(),
            hash: String::new(),
        };
        event.hash = event.compute_hash()?;
        Ok(event)
    }

    /// Recompute the digest from the event content, ignoring the stored `hash`.
    pub fn compute_hash(&self) -> Result<String, CanonicalJsonError> {
        let input = HashInput {
            event_id: &self.event_id,
            timestamp: time::format(self.timestamp),
            event_type: &self.event_type,
            payload: &self.payload,
            prev_hash: &self.prev_hash,
        };
        let bytes = to_canonical_bytes(&input)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Daily partition this event belongs to.
    pub fn partition(&self) -> String {
        partition_for(self.timestamp)
    }
}

/// Partition name (`YYYY-MM-DD`, UTC) for a timestamp.
pub fn partition_for(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample(prev: &str) -> AuditEvent {
        let ts = Utc.with_ymd_and_hms(2026, 5, 4, 10, 30, 0).unwrap();
        AuditEvent::seal(EventId::new(), ts, "job.sim.queued", json!({"job_id": "x"}), prev)
            .unwrap()
    }

    #[test]
    fn sealed_hash_matches_recomputation() {
        let e = sample(ZERO_HASH);
        assert_eq!(e.hash.len(), 64);
        assert_eq!(e.compute_hash().unwrap(), e.hash);
    }

    #[test]
    fn hash_depends_on_prev_hash() {
        let a = sample(ZERO_HASH);
        let mut b = a.clone();
        b.prev_hash = "f".repeat(64);
        assert_ne!(b.compute_hash().unwrap(), a.hash);
    }

    #[test]
    fn hash_survives_json_round_trip() {
        let e = sample(ZERO_HASH);
        let line = serde_json::to_string(&e).unwrap();
        let back: AuditEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back.compute_hash().unwrap(), e.hash);
    }

    #[test]
    fn partition_is_utc_day() {
        assert_eq!(sample(ZERO_HASH).partition(), "2026-05-04");
    }
}
