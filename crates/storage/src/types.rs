use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::DocumentId;

/// Store-native timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreTimestamp(pub i64);

impl StoreTimestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns `None` when the value is outside chrono's representable range.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

/// Schemaless field value.
///
/// `ServerTimestamp` is a write-only sentinel: the store swaps it for its commit
/// time, so it never appears in a stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(StoreTimestamp),
    ServerTimestamp,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<StoreTimestamp> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    /// Total order used by queries: values of different kinds sort by kind first.
    pub fn total_order(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(left), Self::Bool(right)) => left.cmp(right),
            (Self::Integer(left), Self::Integer(right)) => left.cmp(right),
            (Self::Integer(left), Self::Float(right)) => (*left as f64).total_cmp(right),
            (Self::Float(left), Self::Integer(right)) => left.total_cmp(&(*right as f64)),
            (Self::Float(left), Self::Float(right)) => left.total_cmp(right),
            (Self::Text(left), Self::Text(right)) => left.cmp(right),
            (Self::Timestamp(left), Self::Timestamp(right)) => left.cmp(right),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Integer(_) | Self::Float(_) => 2,
            Self::Timestamp(_) => 3,
            Self::Text(_) => 4,
            Self::ServerTimestamp => 5,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<StoreTimestamp> for FieldValue {
    fn from(value: StoreTimestamp) -> Self {
        Self::Timestamp(value)
    }
}

pub type DocumentFields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub collection: String,
    pub fields: DocumentFields,
}

impl StoredDocument {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// Published on the store's change feed after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionChanged {
    pub collection: String,
    pub document_id: DocumentId,
    pub kind: ChangeKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_integer_and_float() {
        assert_eq!(
            FieldValue::Integer(2).total_order(&FieldValue::Float(2.5)),
            Ordering::Less
        );
        assert_eq!(
            FieldValue::Float(3.0).total_order(&FieldValue::Integer(3)),
            Ordering::Equal
        );
    }

    #[test]
    fn mixed_kinds_sort_by_kind() {
        let timestamp = FieldValue::Timestamp(StoreTimestamp::from_millis(i64::MAX));
        let text = FieldValue::from("a");
        assert_eq!(timestamp.total_order(&text), Ordering::Less);
        assert_eq!(FieldValue::Null.total_order(&timestamp), Ordering::Less);
    }

    #[test]
    fn timestamp_converts_to_utc() {
        let converted = StoreTimestamp::from_millis(1_700_000_000_123)
            .to_datetime()
            .expect("in range");
        assert_eq!(converted.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn fields_serialize_with_explicit_kind_tags() {
        let encoded = serde_json::to_string(&FieldValue::Timestamp(StoreTimestamp(5)))
            .expect("serializable");
        assert_eq!(encoded, r#"{"type":"timestamp","value":5}"#);
    }
}
