//! # vigil-transaction
//!
//! A [`Transaction`] records one unit of work: its name, timing, custom
//! attributes and errors. While entered it is the *current* transaction of
//! the calling execution context, found through [`current`] or
//! [`Application::current_transaction`].
//!
//! ```rust
//! use std::sync::Arc;
//! use vigil_core::RequestMetadata;
//! use vigil_transaction::{current, Application, Transaction};
//!
//! let app = Arc::new(Application::new("docs"));
//! let meta = RequestMetadata::new().with("request-uri", "/orders");
//! let txn = Transaction::new(Arc::clone(&app), &meta);
//!
//! txn.enter().unwrap();
//! assert!(Arc::ptr_eq(&current().unwrap(), &txn));
//! txn.exit().unwrap();
//!
//! assert!(current().is_none());
//! assert_eq!(app.drain_finished()[0].path, "/orders");
//! ```

pub mod application;
pub mod context;
pub mod error_log;
pub mod errors;
pub mod record;
pub mod transaction;

pub use application::Application;
pub use context::{ContextId, ContextTable};
pub use error_log::ErrorRecord;
pub use errors::TransactionError;
pub use record::TransactionRecord;
pub use transaction::{Transaction, TransactionGuard, TransactionState, UNKNOWN_PATH};

use std::sync::Arc;

/// The transaction current in the calling context, looked up in the
/// process-wide context table.
pub fn current() -> Option<Arc<Transaction>> {
    ContextTable::global().current()
}
