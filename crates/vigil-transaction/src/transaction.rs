//! The transaction lifecycle.
//!
//! `Inactive → Active → Closed`. Entering makes the transaction current for
//! the calling context; exiting (or dropping the last handle while active)
//! closes it, clears the context slot and hands a [`TransactionRecord`] to
//! the application unless the transaction is ignored or disabled.

use std::any::type_name;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use vigil_core::metadata::parse_queue_start;
use vigil_core::{AttributeKey, AttributeValue, RequestMetadata, TransactionId};

use crate::application::Application;
use crate::context::{ContextId, ContextTable};
use crate::error_log::{ErrorLog, ErrorRecord};
use crate::errors::{Result, TransactionError};
use crate::record::TransactionRecord;

/// Path used when the metadata names none.
pub const UNKNOWN_PATH: &str = "<unknown>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Inactive,
    Active,
    Closed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Closed => "closed",
        })
    }
}

struct Inner {
    state: TransactionState,
    path: String,
    background: bool,
    ignored: bool,
    owner: Option<ContextId>,
    start_time: Option<DateTime<Utc>>,
    started: Option<Instant>,
    end_time: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    queue_start: Option<DateTime<Utc>>,
    custom_attributes: HashMap<AttributeKey, AttributeValue>,
    errors: ErrorLog,
}

/// One monitored unit of work.
///
/// Handed out as `Arc<Transaction>` because [`crate::current`] returns
/// shared handles to whatever is active.
pub struct Transaction {
    id: TransactionId,
    application: Arc<Application>,
    contexts: Arc<ContextTable>,
    enabled: bool,
    inner: Mutex<Inner>,
}

impl Transaction {
    /// Create an inactive transaction from request metadata.
    pub fn new(application: Arc<Application>, metadata: &RequestMetadata) -> Arc<Self> {
        let ns = application.namespace();

        let enabled = match metadata.namespaced_switch(ns, "enabled") {
            Some(enabled) => enabled,
            None => {
                if metadata.get(&format!("{ns}.enabled")).is_some() {
                    debug!(namespace = ns, "unrecognised enabled switch, using application default");
                }
                application.enabled()
            }
        };
        let background = metadata.namespaced_switch(ns, "background_task").unwrap_or(false);
        let ignored = metadata.namespaced_switch(ns, "ignore_transaction").unwrap_or(false);

        let queue_start = metadata.queue_start_header(ns).and_then(|raw| {
            let parsed = parse_queue_start(raw);
            if parsed.is_none() {
                debug!(value = raw, "ignoring malformed queue start");
            }
            parsed
        });

        let inner = Inner {
            state: TransactionState::Inactive,
            path: metadata
                .derive_path()
                .unwrap_or_else(|| UNKNOWN_PATH.to_string()),
            background,
            ignored,
            owner: None,
            start_time: None,
            started: None,
            end_time: None,
            duration: None,
            queue_start,
            custom_attributes: HashMap::new(),
            errors: ErrorLog::new(application.max_errors()),
        };

        Arc::new(Self {
            id: TransactionId::new(),
            contexts: Arc::clone(application.contexts()),
            application,
            enabled,
            inner: Mutex::new(inner),
        })
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    /// Fixed at creation.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    // ── lifecycle ──────────────────────────────────────────────────────────

    /// Start the transaction and make it current for the calling context.
    pub fn enter(self: &Arc<Self>) -> Result<()> {
        let context = ContextId::current();
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Inactive {
            return Err(TransactionError::InvalidState {
                id: self.id.clone(),
                action: "enter",
                state: inner.state,
            });
        }
        self.contexts.install(context, self)?;

        inner.state = TransactionState::Active;
        inner.owner = Some(context);
        if self.enabled {
            inner.start_time = Some(Utc::now());
            inner.started = Some(Instant::now());
        }
        debug!(txn_id = %self.id, path = %inner.path, %context, enabled = self.enabled, "transaction started");
        Ok(())
    }

    /// Close the transaction. A no-op if it is already closed.
    pub fn exit(&self) -> Result<()> {
        self.close(None)
    }

    /// Close the transaction, first recording `error` as the reason.
    pub fn exit_with<E: Error + ?Sized>(&self, error: &E) -> Result<()> {
        self.close(Some(error_record(error)))
    }

    /// Enter and return a guard that exits on drop.
    pub fn guard(self: &Arc<Self>) -> Result<TransactionGuard> {
        self.enter()?;
        Ok(TransactionGuard {
            txn: Arc::clone(self),
            armed: true,
        })
    }

    /// Run `f` inside the transaction.
    ///
    /// An `Err` from `f` is noticed on the transaction and returned as is.
    pub fn scope<T, E, F>(self: &Arc<Self>, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Arc<Transaction>) -> std::result::Result<T, E>,
        E: fmt::Display + From<TransactionError>,
    {
        let guard = self.guard()?;
        let result = f(self);
        match &result {
            Ok(_) => guard.finish()?,
            Err(e) => guard.finish_with(ErrorRecord::new(type_name::<E>(), e.to_string(), None))?,
        }
        result
    }

    fn close(&self, error: Option<ErrorRecord>) -> Result<()> {
        let (owner, record) = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Inactive => {
                    return Err(TransactionError::InvalidState {
                        id: self.id.clone(),
                        action: "exit",
                        state: inner.state,
                    })
                }
                TransactionState::Closed => return Ok(()),
                TransactionState::Active => {}
            }
            inner.state = TransactionState::Closed;
            let owner = inner.owner.take();
            (owner, self.finalize(&mut inner, error))
        };

        if let Some(context) = owner {
            let _ = self.contexts.release(context, self);
        }
        if let Some(record) = record {
            self.application.record(record);
        }
        Ok(())
    }

    fn finalize(&self, inner: &mut Inner, error: Option<ErrorRecord>) -> Option<TransactionRecord> {
        if !self.enabled {
            debug!(txn_id = %self.id, "disabled transaction closed");
            return None;
        }
        if let Some(error) = error {
            inner.errors.push(error);
        }

        let end_time = Utc::now();
        let duration = inner.started.map(|s| s.elapsed()).unwrap_or_default();
        inner.end_time = Some(end_time);
        inner.duration = Some(duration);

        if inner.ignored {
            debug!(txn_id = %self.id, path = %inner.path, "ignored transaction discarded");
            return None;
        }
        debug!(
            txn_id = %self.id,
            path = %inner.path,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            errors = inner.errors.len(),
            "transaction closed"
        );

        Some(TransactionRecord {
            id: self.id.clone(),
            application: self.application.name().to_string(),
            path: inner.path.clone(),
            background: inner.background,
            start_time: inner.start_time,
            end_time,
            duration,
            queue_start_time: inner.queue_start,
            queue_wait: queue_wait(inner.start_time, inner.queue_start),
            custom_attributes: inner.custom_attributes.clone(),
            errors: inner.errors.to_vec(),
            dropped_errors: inner.errors.dropped(),
        })
    }

    /// Apply a mutation. Disabled transactions ignore it; closed ones
    /// refuse it.
    fn mutate(&self, f: impl FnOnce(&mut Inner)) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Closed {
            return Err(TransactionError::Closed {
                id: self.id.clone(),
            });
        }
        f(&mut inner);
        Ok(())
    }

    // ── naming and flags ───────────────────────────────────────────────────

    pub fn path(&self) -> String {
        self.inner.lock().path.clone()
    }

    pub fn set_path(&self, path: impl Into<String>) -> Result<()> {
        let path = path.into();
        self.mutate(|inner| inner.path = path)
    }

    pub fn background(&self) -> bool {
        self.inner.lock().background
    }

    pub fn set_background(&self, background: bool) -> Result<()> {
        self.mutate(|inner| inner.background = background)
    }

    pub fn ignore(&self) -> bool {
        self.inner.lock().ignored
    }

    /// Last value set before close decides whether a record is produced.
    pub fn set_ignore(&self, ignore: bool) -> Result<()> {
        self.mutate(|inner| inner.ignored = ignore)
    }

    // ── attributes ─────────────────────────────────────────────────────────

    /// Last write per key wins.
    pub fn add_custom_attribute(
        &self,
        key: impl Into<AttributeKey>,
        value: impl Into<AttributeValue>,
    ) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.mutate(|inner| {
            let _ = inner.custom_attributes.insert(key, value);
        })
    }

    pub fn custom_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        self.inner.lock().custom_attributes.get(key).cloned()
    }

    pub fn custom_attributes(&self) -> HashMap<AttributeKey, AttributeValue> {
        self.inner.lock().custom_attributes.clone()
    }

    // ── errors ─────────────────────────────────────────────────────────────

    pub fn notice_error(
        &self,
        kind: impl Into<String>,
        message: impl Into<String>,
        traceback: Option<String>,
    ) -> Result<()> {
        let record = ErrorRecord::new(kind, message, traceback);
        self.mutate(|inner| inner.errors.push(record))
    }

    /// Notice a Rust error. The kind is its type name and the traceback
    /// lists its source chain.
    pub fn notice<E: Error + ?Sized>(&self, error: &E) -> Result<()> {
        let record = error_record(error);
        self.mutate(|inner| inner.errors.push(record))
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.inner.lock().errors.to_vec()
    }

    pub fn error_count(&self) -> usize {
        self.inner.lock().errors.len()
    }

    /// Errors discarded because the log was full.
    pub fn dropped_errors(&self) -> u64 {
        self.inner.lock().errors.dropped()
    }

    // ── timing ─────────────────────────────────────────────────────────────

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().end_time
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.lock().duration
    }

    pub fn queue_start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().queue_start
    }

    /// Time between the upstream queue start and this transaction's start.
    pub fn queue_wait(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        queue_wait(inner.start_time, inner.queue_start)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.inner.get_mut().state == TransactionState::Active {
            debug!(txn_id = %self.id, "transaction dropped without exit");
            let _ = self.close(None);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("path", &inner.path)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Exits its transaction when dropped. A panic unwinding through the guard
/// is recorded as an error first.
#[derive(Debug)]
pub struct TransactionGuard {
    txn: Arc<Transaction>,
    armed: bool,
}

impl TransactionGuard {
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }

    /// Exit now instead of at drop.
    pub fn finish(mut self) -> Result<()> {
        self.armed = false;
        self.txn.exit()
    }

    fn finish_with(mut self, error: ErrorRecord) -> Result<()> {
        self.armed = false;
        self.txn.close(Some(error))
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let error = std::thread::panicking()
            .then(|| ErrorRecord::new("panic", "panicked inside transaction", None));
        let _ = self.txn.close(error);
    }
}

fn error_record<E: Error + ?Sized>(error: &E) -> ErrorRecord {
    let mut causes = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    let traceback = (!causes.is_empty()).then(|| causes.join("\n"));
    ErrorRecord::new(type_name::<E>(), error.to_string(), traceback)
}

fn queue_wait(start: Option<DateTime<Utc>>, queued: Option<DateTime<Utc>>) -> Option<Duration> {
    let wait = start? - queued?;
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}
