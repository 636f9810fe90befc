//! Shared value types for the vigil instrumentation core.

pub mod attributes;
pub mod flags;
pub mod ids;
pub mod metadata;

pub use attributes::{AttributeKey, AttributeValue};
pub use ids::{ErrorId, TransactionId};
pub use metadata::{MetadataValue, RequestMetadata};
