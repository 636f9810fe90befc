//! Transaction error types.

use thiserror::Error;
use vigil_core::TransactionId;

use crate::context::ContextId;
use crate::transaction::TransactionState;

/// Errors returned by transaction lifecycle and mutation calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The transaction has been closed and no longer accepts changes.
    #[error("transaction {id} is closed")]
    Closed { id: TransactionId },

    /// Lifecycle call not valid in the current state, e.g. entering twice.
    #[error("transaction {id} cannot {action} while {state}")]
    InvalidState {
        id: TransactionId,
        action: &'static str,
        state: TransactionState,
    },

    /// Another live transaction is already current for this context.
    #[error("context {context} already has a current transaction")]
    ContextOccupied { context: ContextId },
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;
