//! Finished-transaction snapshots.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use vigil_core::{AttributeKey, AttributeValue, TransactionId};

use crate::error_log::ErrorRecord;

/// Immutable snapshot of a closed transaction, queued on its application
/// for the reporter to drain.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub application: String,
    pub path: String,
    pub background: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_wait: Option<Duration>,
    /// Serialized as `[{"key": .., "value": ..}]`, ordered by key, since
    /// keys are not all strings.
    #[serde(serialize_with = "serialize_attributes")]
    pub custom_attributes: HashMap<AttributeKey, AttributeValue>,
    pub errors: Vec<ErrorRecord>,
    pub dropped_errors: u64,
}

impl TransactionRecord {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Serialize)]
struct AttributeEntry<'a> {
    key: &'a AttributeKey,
    value: &'a AttributeValue,
}

fn key_rank(key: &AttributeKey) -> u8 {
    match key {
        AttributeKey::Bool(_) => 0,
        AttributeKey::Int(_) => 1,
        AttributeKey::Float(_) => 2,
        AttributeKey::Str(_) => 3,
    }
}

fn compare_keys(a: &AttributeKey, b: &AttributeKey) -> Ordering {
    match (a, b) {
        (AttributeKey::Bool(x), AttributeKey::Bool(y)) => x.cmp(y),
        (AttributeKey::Int(x), AttributeKey::Int(y)) => x.cmp(y),
        (AttributeKey::Float(x), AttributeKey::Float(y)) => x.total_cmp(y),
        (AttributeKey::Str(x), AttributeKey::Str(y)) => x.cmp(y),
        _ => key_rank(a).cmp(&key_rank(b)),
    }
}

fn serialize_attributes<S: Serializer>(
    attributes: &HashMap<AttributeKey, AttributeValue>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut entries: Vec<AttributeEntry<'_>> = attributes
        .iter()
        .map(|(key, value)| AttributeEntry { key, value })
        .collect();
    entries.sort_by(|a, b| compare_keys(a.key, b.key));
    serializer.collect_seq(entries)
}
