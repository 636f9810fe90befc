//! Execution contexts and the current-transaction table.
//!
//! An execution context is the enclosing [`ContextId::scope`] when running
//! inside one (a tokio task-local), otherwise the calling thread. Each
//! context has at most one current transaction.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::errors::TransactionError;
use crate::transaction::Transaction;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_CONTEXT: ContextId = ContextId::allocate();
}

tokio::task_local! {
    static TASK_CONTEXT: ContextId;
}

/// Identifies one execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn allocate() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The calling code's context.
    pub fn current() -> Self {
        TASK_CONTEXT
            .try_with(|id| *id)
            .unwrap_or_else(|_| THREAD_CONTEXT.with(|id| *id))
    }

    /// Run `fut` in a fresh context of its own.
    ///
    /// Tasks multiplexed on one worker thread otherwise share that thread's
    /// context.
    pub async fn scope<F: Future>(fut: F) -> F::Output {
        TASK_CONTEXT.scope(Self::allocate(), fut).await
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Context → current transaction.
///
/// Holds weak references only; a transaction dropped without exiting clears
/// its own slot.
#[derive(Default)]
pub struct ContextTable {
    slots: DashMap<ContextId, Weak<Transaction>>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table.
    pub fn global() -> &'static Arc<ContextTable> {
        static GLOBAL: OnceLock<Arc<ContextTable>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ContextTable::new()))
    }

    /// Current transaction of the calling context.
    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.get(ContextId::current())
    }

    pub fn get(&self, context: ContextId) -> Option<Arc<Transaction>> {
        // Release the shard guard before upgrading: dropping the upgraded
        // handle may run Transaction::drop, which touches this map.
        let weak = self.slots.get(&context).map(|slot| slot.value().clone())?;
        weak.upgrade()
    }

    /// Number of contexts with a live current transaction.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.strong_count() > 0).count()
    }

    /// Make `txn` current for `context` unless a live transaction already is.
    pub(crate) fn install(
        &self,
        context: ContextId,
        txn: &Arc<Transaction>,
    ) -> Result<(), TransactionError> {
        match self.slots.entry(context) {
            Entry::Occupied(mut slot) => {
                if slot.get().strong_count() > 0 {
                    return Err(TransactionError::ContextOccupied { context });
                }
                let _ = slot.insert(Arc::downgrade(txn));
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(Arc::downgrade(txn));
            }
        }
        Ok(())
    }

    /// Clear `context` if `txn` is still the transaction installed there.
    pub(crate) fn release(&self, context: ContextId, txn: *const Transaction) -> bool {
        self.slots
            .remove_if(&context, |_, slot| std::ptr::eq(slot.as_ptr(), txn))
            .is_some()
    }
}

impl fmt::Debug for ContextTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextTable")
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_context_is_stable_and_distinct() {
        let here = ContextId::current();
        assert_eq!(here, ContextId::current());
        let there = std::thread::spawn(ContextId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[tokio::test]
    async fn scope_gets_its_own_context() {
        let outer = ContextId::current();
        let inner = ContextId::scope(async { ContextId::current() }).await;
        let other = ContextId::scope(async { ContextId::current() }).await;
        assert_ne!(outer, inner);
        assert_ne!(inner, other);
        assert_eq!(outer, ContextId::current());
    }

    #[test]
    fn empty_table_has_no_current() {
        let table = ContextTable::new();
        assert!(table.current().is_none());
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn display_form() {
        assert_eq!(ContextId(7).to_string(), "ctx-7");
    }
}
