//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may contain any subset of fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings type for the agent.
///
/// ```json
/// {
///   "appName": "checkout",
///   "enabled": true,
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Name of the monitored application.
    pub app_name: String,
    /// Global instrumentation switch; individual requests may override it.
    pub enabled: bool,
    /// Prefix of the request metadata keys the agent interprets
    /// (`<namespace>.enabled`, `<namespace>.queue_start`, ...).
    pub namespace: String,
    /// Errors kept per transaction before the oldest are dropped.
    pub max_errors_per_transaction: usize,
    /// Finished transaction records held for a reporter before the oldest
    /// are dropped.
    pub max_finished_transactions: usize,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            app_name: "Vigil Application".to_string(),
            enabled: true,
            namespace: "vigil".to_string(),
            max_errors_per_transaction: 20,
            max_finished_transactions: 1000,
            logging: LoggingSettings::default(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Optional file receiving a copy of every log line.
    pub file: Option<PathBuf>,
    /// Emit JSON lines on stdout instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: true,
        }
    }
}
