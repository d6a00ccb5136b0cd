//! Chain verification.
//!
//! Walks partitions oldest to newest, recomputes every digest, checks each
//! `prev_hash` against the preceding event and, when a policy is given,
//! checks object retention locks. Stops at the first failure. Never writes.

use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use simbridge_core::EventId;

use crate::event::{AuditEvent, ZERO_HASH};
use crate::store::{AuditStore, RawEntry, RetentionMode, StoreError};

/// Inclusive range of daily partitions to verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl VerifyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    fn position(&self, partition: &str) -> RangePosition {
        let Ok(day) = NaiveDate::parse_from_str(partition, "%Y-%m-%d") else {
            // Unparseable partition names sort with everything else and are
            // only skipped by an explicit bound.
            return RangePosition::Inside;
        };
        if self.from.is_some_and(|from| day < from) {
            RangePosition::Before
        } else if self.to.is_some_and(|to| day > to) {
            RangePosition::After
        } else {
            RangePosition::Inside
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RangePosition {
    Before,
    Inside,
    After,
}

/// Retention-lock requirements for write-once backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub mode: RetentionMode,
    pub min_days: u32,
}

/// Why an entry failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Recomputed digest differs from the stored one.
    HashMismatch { expected: String, actual: String },
    /// `prev_hash` does not point at the preceding event.
    BrokenLink { expected: String, actual: String },
    /// Entry could not be decoded.
    Unreadable { detail: String },
    /// Stored bytes differ from the encoding the writer produces, even
    /// though they decode to an event that hashes correctly.
    NonCanonicalEncoding { detail: String },
    /// Object retention lock is missing or weaker than policy.
    RetentionMismatch { detail: String },
}

/// Precise location of the first failing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityFailure {
    pub partition: String,
    pub offset: u64,
    pub locator: String,
    pub event_id: Option<EventId>,
    #[serde(flatten)]
    pub reason: FailureReason,
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {} offset {} ({})",
            self.partition, self.offset, self.locator
        )?;
        if let Some(id) = self.event_id {
            write!(f, " event {id}")?;
        }
        match &self.reason {
            FailureReason::HashMismatch { expected, actual } => {
                write!(f, ": hash mismatch, expected {expected}, stored {actual}")
            }
            FailureReason::BrokenLink { expected, actual } => {
                write!(f, ": broken link, expected prev_hash {expected}, found {actual}")
            }
            FailureReason::Unreadable { detail } => write!(f, ": unreadable entry: {detail}"),
            FailureReason::NonCanonicalEncoding { detail } => {
                write!(f, ": non-canonical encoding: {detail}")
            }
            FailureReason::RetentionMismatch { detail } => {
                write!(f, ": retention mismatch: {detail}")
            }
        }
    }
}

/// Outcome of a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    /// Events that verified before the first failure.
    pub checked: u64,
    pub partitions: usize,
    pub failure: Option<IntegrityFailure>,
}

impl VerifyReport {
    fn failed(checked: u64, partitions: usize, failure: IntegrityFailure) -> Self {
        Self {
            ok: false,
            checked,
            partitions,
            failure: Some(failure),
        }
    }
}

fn decode(partition: &str, entry: &RawEntry) -> Result<AuditEvent, IntegrityFailure> {
    serde_json::from_slice(&entry.bytes).map_err(|e| IntegrityFailure {
        partition: partition.to_string(),
        offset: entry.offset,
        locator: entry.locator.clone(),
        event_id: None,
        reason: FailureReason::Unreadable {
            detail: e.to_string(),
        },
    })
}

fn check_retention(
    event: &AuditEvent,
    entry: &RawEntry,
    policy: &RetentionPolicy,
) -> Option<String> {
    let Some(retention) = &entry.retention else {
        return Some("object has no retention lock".to_string());
    };
    if retention.mode != policy.mode {
        return Some(format!(
            "lock mode {:?}, policy requires {:?}",
            retention.mode, policy.mode
        ));
    }
    let required = event.timestamp + Duration::days(i64::from(policy.min_days));
    if retention.retain_until < required {
        return Some(format!(
            "retained until {}, policy requires at least {}",
            retention.retain_until, required
        ));
    }
    None
}

/// Newest stored entry across `partitions`, skipping empty ones.
///
/// A partition can exist with no entries (created before a failed write), so
/// the chain tail lives in the newest partition that actually holds events.
pub(crate) async fn last_stored_entry<'a>(
    store: &dyn AuditStore,
    partitions: impl DoubleEndedIterator<Item = &'a String>,
) -> Result<Option<(&'a String, RawEntry)>, StoreError> {
    for partition in partitions.rev() {
        let mut entries = store.read_partition(partition).await?;
        if let Some(last) = entries.pop() {
            return Ok(Some((partition, last)));
        }
    }
    Ok(None)
}

/// Hash of the last event strictly before the verified range.
async fn seed_hash<'a>(
    store: &dyn AuditStore,
    before: impl DoubleEndedIterator<Item = &'a String>,
) -> Result<Result<String, IntegrityFailure>, StoreError> {
    match last_stored_entry(store, before).await? {
        Some((partition, last)) => Ok(decode(partition, &last).map(|e| e.hash)),
        None => Ok(Ok(ZERO_HASH.to_string())),
    }
}

/// How `bytes` differ from what the writer emits for `event`, if at all.
///
/// The digest covers decoded values, so edits that decode to the same values
/// (`1.0` as `1e0`, a space for the `T` in a timestamp) only show up here.
fn encoding_mismatch(event: &AuditEvent, bytes: &[u8]) -> Option<String> {
    match serde_json::to_vec(event) {
        Ok(expected) if expected == bytes => None,
        Ok(expected) => {
            let at = expected
                .iter()
                .zip(bytes)
                .position(|(a, b)| a != b)
                .unwrap_or_else(|| expected.len().min(bytes.len()));
            Some(format!("stored bytes diverge at byte {at}"))
        }
        Err(e) => Some(e.to_string()),
    }
}

/// Verify the chain held by `store` over `range`.
///
/// A range starting after the first partition is seeded with the stored hash
/// of the last event before it, so verifying a window does not require
/// re-walking history.
pub async fn verify_store(
    store: &dyn AuditStore,
    range: VerifyRange,
    policy: Option<&RetentionPolicy>,
) -> Result<VerifyReport, StoreError> {
    let all = store.partitions().await?;
    let before: Vec<&String> = all
        .iter()
        .filter(|p| range.position(p) == RangePosition::Before)
        .collect();
    let selected: Vec<&String> = all
        .iter()
        .filter(|p| range.position(p) == RangePosition::Inside)
        .collect();

    let mut checked = 0u64;
    let mut prev = match seed_hash(store, before.iter().copied()).await? {
        Ok(hash) => hash,
        Err(failure) => return Ok(VerifyReport::failed(0, 0, failure)),
    };

    for (visited, partition) in selected.iter().enumerate() {
        let entries = store.read_partition(partition).await?;
        for entry in &entries {
            let event = match decode(partition, entry) {
                Ok(e) => e,
                Err(failure) => return Ok(VerifyReport::failed(checked, visited + 1, failure)),
            };
            let fail = |reason| IntegrityFailure {
                partition: partition.to_string(),
                offset: entry.offset,
                locator: entry.locator.clone(),
                event_id: Some(event.event_id),
                reason,
            };

            let recomputed = match event.compute_hash() {
                Ok(h) => h,
                Err(e) => {
                    let failure = fail(FailureReason::Unreadable {
                        detail: e.to_string(),
                    });
                    return Ok(VerifyReport::failed(checked, visited + 1, failure));
                }
            };
            if recomputed != event.hash {
                let failure = fail(FailureReason::HashMismatch {
                    expected: recomputed,
                    actual: event.hash.clone(),
                });
                return Ok(VerifyReport::failed(checked, visited + 1, failure));
            }
            if event.prev_hash != prev {
                let failure = fail(FailureReason::BrokenLink {
                    expected: prev,
                    actual: event.prev_hash.clone(),
                });
                return Ok(VerifyReport::failed(checked, visited + 1, failure));
            }
            if let Some(detail) = encoding_mismatch(&event, &entry.bytes) {
                let failure = fail(FailureReason::NonCanonicalEncoding { detail });
                return Ok(VerifyReport::failed(checked, visited + 1, failure));
            }
            if let Some(detail) = policy.and_then(|p| check_retention(&event, entry, p)) {
                let failure = fail(FailureReason::RetentionMismatch { detail });
                return Ok(VerifyReport::failed(checked, visited + 1, failure));
            }

            checked += 1;
            prev = event.hash;
        }
    }

    Ok(VerifyReport {
        ok: true,
        checked,
        partitions: selected.len(),
        failure: None,
    })
}
