//! Normalization of third-party JSON at the service boundary
//!
//! Upstream payloads are inconsistent: a field may be an object in one
//! response and an empty list in the next, numbers arrive as strings, and
//! single records come wrapped in one-element arrays. The helpers here read
//! such values leniently so the rest of the service only sees canonical
//! records.

pub mod acrcloud;
pub mod soundcharts;

use serde_json::{Map, Value};
use thiserror::Error;

/// Payload could not be reduced to a canonical record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("payload has no file id")]
    MissingFileId,

    #[error("payload has no {0} record")]
    MissingRecord(&'static str),
}

/// View a value as a record
///
/// Objects are returned as-is; arrays yield their first object element;
/// anything else (null, `[]`, scalars) has no record.
pub(crate) fn as_record(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Array(items) => items.iter().find_map(|item| item.as_object()),
        _ => None,
    }
}

/// Non-null field of a record-like value
pub(crate) fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    as_record(value)?.get(key).filter(|v| !v.is_null())
}

/// Walk nested record fields
pub(crate) fn path<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |current, key| field(current, key))
}

/// Non-empty string; numbers are rendered, arrays yield their first text
pub(crate) fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.iter().find_map(text),
        _ => None,
    }
}

/// Number from a JSON number or a numeric string
pub(crate) fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// Integer from a JSON number or numeric string (fractions truncated)
pub(crate) fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

/// Names from a list of strings, a list of `{name}` objects, or a single one
pub(crate) fn names(value: &Value) -> Vec<String> {
    let one = |item: &Value| match item {
        Value::Object(_) => field(item, "name").and_then(text),
        other => text(other),
    };

    match value {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        other => one(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_record_accepts_object_and_list() {
        assert!(as_record(&json!({"a": 1})).is_some());
        assert_eq!(as_record(&json!([{"a": 1}])).unwrap()["a"], 1);
        assert!(as_record(&json!([])).is_none());
        assert!(as_record(&json!(null)).is_none());
        assert!(as_record(&json!("x")).is_none());
    }

    #[test]
    fn test_path_through_mixed_shapes() {
        let value = json!({"spotify": [{"track": {"id": "sp1"}}]});
        assert_eq!(path(&value, &["spotify", "track", "id"]).and_then(text), Some("sp1".to_string()));

        let empty = json!({"spotify": []});
        assert!(path(&empty, &["spotify", "track", "id"]).is_none());
    }

    #[test]
    fn test_scalars() {
        assert_eq!(number(&json!("87.5")), Some(87.5));
        assert_eq!(number(&json!("NaN")), None);
        assert_eq!(integer(&json!("12")), Some(12));
        assert_eq!(integer(&json!(3.9)), Some(3));
        assert_eq!(text(&json!("  ")), None);
        assert_eq!(text(&json!(42)), Some("42".to_string()));
        assert_eq!(text(&json!(["", "US1234"])), Some("US1234".to_string()));
    }

    #[test]
    fn test_names_shapes() {
        assert_eq!(names(&json!([{"name": "A"}, {"name": "B"}])), vec!["A", "B"]);
        assert_eq!(names(&json!(["A", "B"])), vec!["A", "B"]);
        assert_eq!(names(&json!("Solo")), vec!["Solo"]);
        assert!(names(&json!([])).is_empty());
    }
}
