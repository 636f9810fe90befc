//! The monitored application.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use vigil_settings::AgentSettings;

use crate::context::ContextTable;
use crate::record::TransactionRecord;
use crate::transaction::Transaction;

pub const DEFAULT_NAMESPACE: &str = "vigil";
pub const DEFAULT_MAX_ERRORS: usize = 20;
pub const DEFAULT_MAX_FINISHED: usize = 1000;

/// Shared by every transaction it creates. Collects finished records until
/// a reporter drains them; past `max_finished` the oldest record is dropped.
pub struct Application {
    name: String,
    enabled: AtomicBool,
    namespace: String,
    max_errors: usize,
    contexts: Arc<ContextTable>,
    finished: Mutex<VecDeque<TransactionRecord>>,
    max_finished: usize,
    dropped_finished: AtomicU64,
}

impl Application {
    /// Enabled application using the default namespace, the default error
    /// capacity and the process-wide context table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_errors: DEFAULT_MAX_ERRORS,
            contexts: Arc::clone(ContextTable::global()),
            finished: Mutex::new(VecDeque::new()),
            max_finished: DEFAULT_MAX_FINISHED,
            dropped_finished: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.app_name.clone())
            .with_enabled(settings.enabled)
            .with_namespace(settings.namespace.clone())
            .with_max_errors(settings.max_errors_per_transaction)
            .with_max_finished(settings.max_finished_transactions)
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Errors kept per transaction. Clamped to at least one.
    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors.max(1);
        self
    }

    /// Finished records held before the oldest are dropped. Clamped to at
    /// least one.
    pub fn with_max_finished(mut self, max_finished: usize) -> Self {
        self.max_finished = max_finished.max(1);
        self
    }

    /// Track current transactions in `contexts` instead of the process-wide
    /// table.
    pub fn with_context_table(mut self, contexts: Arc<ContextTable>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Affects transactions created afterwards.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn max_errors(&self) -> usize {
        self.max_errors
    }

    pub fn max_finished(&self) -> usize {
        self.max_finished
    }

    pub fn contexts(&self) -> &Arc<ContextTable> {
        &self.contexts
    }

    /// The transaction current in the calling context, per this
    /// application's context table.
    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.contexts.current()
    }

    /// Queue a finished transaction, dropping the oldest queued record if
    /// the queue is full.
    pub fn record(&self, record: TransactionRecord) {
        debug!(
            app = %self.name,
            txn_id = %record.id,
            path = %record.path,
            errors = record.errors.len(),
            "transaction recorded"
        );
        let mut finished = self.finished.lock();
        if finished.len() >= self.max_finished {
            if let Some(oldest) = finished.pop_front() {
                let _ = self.dropped_finished.fetch_add(1, Ordering::Relaxed);
                debug!(app = %self.name, txn_id = %oldest.id, "finished queue full, dropped oldest record");
            }
        }
        finished.push_back(record);
    }

    /// Take every queued record, oldest first.
    pub fn drain_finished(&self) -> Vec<TransactionRecord> {
        std::mem::take(&mut *self.finished.lock()).into()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Records discarded because the finished queue was full.
    pub fn dropped_finished(&self) -> u64 {
        self.dropped_finished.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("enabled", &self.enabled())
            .field("namespace", &self.namespace)
            .field("max_errors", &self.max_errors)
            .field("max_finished", &self.max_finished)
            .finish()
    }
}
