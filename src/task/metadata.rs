//! Typed metadata bags attached to tasks and step results.
//!
//! Values are restricted to strings, numbers, booleans and nested maps so that
//! metadata stays serializable into checkpoints and events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Open key-value map with narrow value kinds.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    Map(Metadata),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Metadata> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u64> for MetadataValue {
    fn from(value: u64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<Metadata> for MetadataValue {
    fn from(value: Metadata) -> Self {
        Self::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_metadata_serializes_untagged() {
        let mut inner = Metadata::new();
        inner.insert("retries".to_string(), 2u64.into());

        let mut meta = Metadata::new();
        meta.insert("agent".to_string(), "researcher".into());
        meta.insert("urgent".to_string(), true.into());
        meta.insert("stats".to_string(), inner.into());

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["agent"], "researcher");
        assert_eq!(json["urgent"], true);
        assert_eq!(json["stats"]["retries"], 2.0);

        let back: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
        assert_eq!(
            back["stats"].as_map().and_then(|m| m["retries"].as_f64()),
            Some(2.0)
        );
    }
}
