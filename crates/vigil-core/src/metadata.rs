//! Request-like metadata handed to a transaction at creation.
//!
//! Mirrors a CGI/WSGI environment: a flat map of string keys to scalar
//! values. Only a handful of keys are interpreted; the rest is carried along
//! untouched.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flags::parse_switch;

pub const REQUEST_URI: &str = "request-uri";
pub const SCRIPT_NAME: &str = "script-name";
pub const PATH_INFO: &str = "path-info";

/// CGI spellings accepted as aliases of the keys above.
const CGI_ALIASES: &[(&str, &str)] = &[
    (REQUEST_URI, "REQUEST_URI"),
    (SCRIPT_NAME, "SCRIPT_NAME"),
    (PATH_INFO, "PATH_INFO"),
];

/// A single metadata value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as a switch: booleans as-is, strings via
    /// [`parse_switch`], integers as non-zero.
    pub fn as_switch(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Str(s) => parse_switch(s),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Request metadata mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestMetadata(HashMap<String, MetadataValue>);

impl RequestMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let _ = self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up one of the well-known path keys, falling back to its CGI alias.
    fn path_part(&self, key: &str) -> Option<&str> {
        self.get_str(key).or_else(|| {
            CGI_ALIASES
                .iter()
                .find(|(canonical, _)| *canonical == key)
                .and_then(|(_, alias)| self.get_str(alias))
        })
    }

    /// Derive the unit-of-work name.
    ///
    /// `request-uri` wins; otherwise `script-name` followed by `path-info`;
    /// otherwise `path-info` alone; otherwise `None`.
    pub fn derive_path(&self) -> Option<String> {
        if let Some(uri) = self.path_part(REQUEST_URI) {
            return Some(uri.to_owned());
        }
        if let Some(script) = self.path_part(SCRIPT_NAME) {
            let info = self.path_part(PATH_INFO).unwrap_or("");
            return Some(format!("{script}{info}"));
        }
        self.path_part(PATH_INFO).map(str::to_owned)
    }

    /// Read `<namespace>.<name>` as a switch.
    pub fn namespaced_switch(&self, namespace: &str, name: &str) -> Option<bool> {
        self.get(&format!("{namespace}.{name}"))
            .and_then(MetadataValue::as_switch)
    }

    /// Raw queue-start header value, from `<namespace>.queue_start` or the
    /// CGI form `HTTP_X_<NAMESPACE>_QUEUE_START`.
    pub fn queue_start_header(&self, namespace: &str) -> Option<&str> {
        self.get_str(&format!("{namespace}.queue_start")).or_else(|| {
            let header = format!("HTTP_X_{}_QUEUE_START", namespace.to_ascii_uppercase());
            self.get_str(&header)
        })
    }
}

impl<K: Into<String>, V: Into<MetadataValue>> FromIterator<(K, V)> for RequestMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Parse a queue-start header of the form `t=<unix-microseconds>`.
pub fn parse_queue_start(raw: &str) -> Option<DateTime<Utc>> {
    let micros: i64 = raw.trim().strip_prefix("t=")?.trim().parse().ok()?;
    if micros <= 0 {
        return None;
    }
    DateTime::from_timestamp_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uri_wins() {
        let meta = RequestMetadata::new()
            .with(REQUEST_URI, "/x")
            .with(SCRIPT_NAME, "/a")
            .with(PATH_INFO, "b");
        assert_eq!(meta.derive_path().as_deref(), Some("/x"));
    }

    #[test]
    fn script_name_concatenates_path_info() {
        let meta = RequestMetadata::new().with(SCRIPT_NAME, "/a").with(PATH_INFO, "b");
        assert_eq!(meta.derive_path().as_deref(), Some("/ab"));
    }

    #[test]
    fn script_name_alone() {
        let meta = RequestMetadata::new().with(SCRIPT_NAME, "/a");
        assert_eq!(meta.derive_path().as_deref(), Some("/a"));
    }

    #[test]
    fn path_info_alone() {
        let meta = RequestMetadata::new().with(PATH_INFO, "b");
        assert_eq!(meta.derive_path().as_deref(), Some("b"));
    }

    #[test]
    fn empty_has_no_path() {
        assert_eq!(RequestMetadata::new().derive_path(), None);
    }

    #[test]
    fn cgi_aliases_accepted() {
        let meta = RequestMetadata::new()
            .with("SCRIPT_NAME", "/script_")
            .with("PATH_INFO", "info");
        assert_eq!(meta.derive_path().as_deref(), Some("/script_info"));
    }

    #[test]
    fn non_string_path_is_ignored() {
        let meta = RequestMetadata::new().with(REQUEST_URI, true).with(PATH_INFO, "b");
        assert_eq!(meta.derive_path().as_deref(), Some("b"));
    }

    #[test]
    fn namespaced_switch_forms() {
        let meta = RequestMetadata::new()
            .with("vigil.enabled", "Off")
            .with("vigil.background_task", true)
            .with("vigil.ignore_transaction", "sometimes");
        assert_eq!(meta.namespaced_switch("vigil", "enabled"), Some(false));
        assert_eq!(meta.namespaced_switch("vigil", "background_task"), Some(true));
        assert_eq!(meta.namespaced_switch("vigil", "ignore_transaction"), None);
        assert_eq!(meta.namespaced_switch("other", "enabled"), None);
    }

    #[test]
    fn queue_start_header_lookup() {
        let meta = RequestMetadata::new().with("HTTP_X_VIGIL_QUEUE_START", "t=1");
        assert_eq!(meta.queue_start_header("vigil"), Some("t=1"));

        let meta = RequestMetadata::new().with("vigil.queue_start", "t=2");
        assert_eq!(meta.queue_start_header("vigil"), Some("t=2"));
    }

    #[test]
    fn parse_queue_start_micros() {
        let ts = parse_queue_start("t=1700000000123456").unwrap();
        assert_eq!(ts.timestamp_micros(), 1_700_000_000_123_456);
    }

    #[test]
    fn parse_queue_start_rejects_malformed() {
        assert!(parse_queue_start("1700000000").is_none());
        assert!(parse_queue_start("t=abc").is_none());
        assert!(parse_queue_start("t=-5").is_none());
        assert!(parse_queue_start("").is_none());
    }
}
