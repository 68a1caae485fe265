//! Untyped observation values as delivered by the telemetry source.
//!
//! The source hands back one flat map per observation. Values are mostly
//! strings (the search API serializes everything as text), occasionally
//! multi-valued lists, and sometimes already-typed timestamps when an
//! adapter has parsed them. [`normalize`](crate::normalize::normalize) is the
//! only consumer of these values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw observation: field name to untyped value.
pub type RawObservation = BTreeMap<String, RawValue>;

/// One untyped field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// An explicit null.
    Null,
    /// An integer (event-kind codes, store ids).
    Int(i64),
    /// A string.
    Text(String),
    /// A multi-valued field.
    List(Vec<RawValue>),
    /// An already-parsed timestamp.
    Timestamp(DateTime<Utc>),
    /// Any other JSON value (booleans, floats, objects).
    Other(serde_json::Value),
}

impl RawValue {
    /// Return the value as text if it is a non-empty string.
    ///
    /// Empty strings count as "unset" everywhere in the model.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) if !text.is_empty() => Some(text),
            _ => None,
        }
    }

    /// Whether this value carries no information (null, empty string, or
    /// an empty list).
    pub fn is_unset(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(text) => text.trim().is_empty(),
            Self::List(items) => items.iter().all(Self::is_unset),
            Self::Int(_) | Self::Timestamp(_) | Self::Other(_) => false,
        }
    }
}

impl From<&str> for RawValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for RawValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_search_result_shapes() {
        let raw: RawObservation = serde_json::from_str(
            r#"{"mac":"aa:bb","event_type":["DHCPACK","DHCPEXPIRE"],"code":7,"ip":null,"flag":true}"#,
        )
        .unwrap();
        assert_eq!(raw.get("mac"), Some(&RawValue::Text("aa:bb".to_owned())));
        assert_eq!(raw.get("code"), Some(&RawValue::Int(7)));
        assert_eq!(raw.get("ip"), Some(&RawValue::Null));
        assert!(matches!(raw.get("event_type"), Some(RawValue::List(items)) if items.len() == 2));
        assert!(matches!(raw.get("flag"), Some(RawValue::Other(_))));
    }

    #[test]
    fn empty_values_are_unset() {
        assert!(RawValue::from("").is_unset());
        assert!(RawValue::from("  ").is_unset());
        assert!(RawValue::List(vec![RawValue::Null]).is_unset());
        assert!(!RawValue::from("x").is_unset());
        assert_eq!(RawValue::from("").as_text(), None);
    }
}
