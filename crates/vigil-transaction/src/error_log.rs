//! Errors noticed during a transaction.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil_core::ErrorId;

/// One noticed error.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: ErrorId,
    /// Error type name, e.g. `std::io::Error` or `ValueError`.
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, traceback: Option<String>) -> Self {
        Self {
            id: ErrorId::new(),
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
            traceback,
        }
    }
}

/// Bounded error list. When full, the oldest record is dropped.
#[derive(Debug)]
pub(crate) struct ErrorLog {
    records: VecDeque<ErrorRecord>,
    capacity: usize,
    dropped: u64,
}

impl ErrorLog {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(32)),
            capacity,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, record: ErrorRecord) {
        if self.records.len() == self.capacity {
            let _ = self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(record);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn to_vec(&self) -> Vec<ErrorRecord> {
        self.records.iter().cloned().collect()
    }
}
