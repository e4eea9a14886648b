//! Dynamic field values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dynamically typed field value carried by a delta.
///
/// Values compare structurally; two maps are equal when they hold equal
/// values under the same keys regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent / null value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Ordered list.
    List(Vec<FieldValue>),
    /// String-keyed map.
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Creates a text value.
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the list content, if this is a list value.
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Combines a queued payload with a newer one.
    ///
    /// Lists are concatenated. Maps are merged key by key: lists under the
    /// same key are concatenated and any other newer value replaces the
    /// older one. Anything else is replaced by the newer value.
    pub fn coalesce(self, newer: FieldValue) -> FieldValue {
        match (self, newer) {
            (FieldValue::List(mut older), FieldValue::List(newer)) => {
                older.extend(newer);
                FieldValue::List(older)
            }
            (FieldValue::Map(mut older), FieldValue::Map(newer)) => {
                for (key, value) in newer {
                    let merged = match (older.remove(&key), value) {
                        (Some(FieldValue::List(mut items)), FieldValue::List(more)) => {
                            items.extend(more);
                            FieldValue::List(items)
                        }
                        (_, value) => value,
                    };
                    older.insert(key, merged);
                }
                FieldValue::Map(older)
            }
            (_, newer) => newer,
        }
    }
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Null
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(items: Vec<T>) -> Self {
        FieldValue::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_concatenates_lists() {
        let merged = FieldValue::from(vec!["a"]).coalesce(FieldValue::from(vec!["b", "c"]));
        assert_eq!(merged, FieldValue::from(vec!["a", "b", "c"]));
    }

    #[test]
    fn coalesce_spreads_maps() {
        let mut older = BTreeMap::new();
        older.insert("x".to_string(), FieldValue::Integer(1));
        older.insert("y".to_string(), FieldValue::Integer(2));
        let mut newer = BTreeMap::new();
        newer.insert("y".to_string(), FieldValue::Integer(20));
        newer.insert("z".to_string(), FieldValue::Integer(30));

        let merged = FieldValue::Map(older).coalesce(FieldValue::Map(newer));
        let FieldValue::Map(map) = merged else {
            panic!("expected map");
        };
        assert_eq!(map.len(), 3);
        assert_eq!(map["y"], FieldValue::Integer(20));
    }

    #[test]
    fn coalesce_concatenates_lists_inside_maps() {
        let mut older = BTreeMap::new();
        older.insert("emojis".to_string(), FieldValue::from(vec!["a"]));
        let mut newer = BTreeMap::new();
        newer.insert("emojis".to_string(), FieldValue::from(vec!["b"]));

        let merged = FieldValue::Map(older).coalesce(FieldValue::Map(newer));
        let FieldValue::Map(map) = merged else {
            panic!("expected map");
        };
        assert_eq!(map["emojis"], FieldValue::from(vec!["a", "b"]));
    }

    #[test]
    fn coalesce_mixed_takes_newer() {
        let merged = FieldValue::from(vec![1i64]).coalesce(FieldValue::text("x"));
        assert_eq!(merged, FieldValue::text("x"));
    }

    #[test]
    fn json_is_untagged() {
        let json = serde_json::to_string(&FieldValue::from(vec!["a"])).unwrap();
        assert_eq!(json, r#"["a"]"#);
        let back: FieldValue = serde_json::from_str("42").unwrap();
        assert_eq!(back, FieldValue::Integer(42));
        let float: FieldValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(float, FieldValue::Float(1.5));
    }
}
