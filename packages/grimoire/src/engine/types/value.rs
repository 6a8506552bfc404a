use super::record_id::RecordId;
use super::zset::FastMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::SmolStr;

/// Dynamic value as it crosses the schemaless wire format.
///
/// JSON numbers split into `Int` and `Float` so that integer content hashes
/// deterministically as two's-complement rather than via float formatting.
/// `Timestamp` (milliseconds since epoch) and `Record` never arrive from raw
/// JSON; they are produced by the sanitizer and by hosts that construct
/// values programmatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(SmolStr),
    Timestamp(i64),
    Record(RecordId),
    List(Vec<Value>),
    Map(FastMap<SmolStr, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            Value::Record(r) => Some(r.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&FastMap<SmolStr, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The record id this value references, if it is a reference at all.
    /// String-typed references (`"thread:abc"`) count; that is how record
    /// links look after sanitization.
    pub fn as_record_id(&self) -> Option<RecordId> {
        match self {
            Value::Record(r) => Some(r.clone()),
            Value::Str(s) => RecordId::parse(s.as_str()),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(SmolStr::from(s)),
            serde_json::Value::Array(arr) => {
                Value::List(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => Value::Map(
                obj.into_iter()
                    .map(|(k, v)| (SmolStr::from(k), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(val: Value) -> Self {
        match val {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(n) => json!(n),
            Value::Float(n) => json!(n),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Timestamp(ms) => json!(ms),
            Value::Record(r) => serde_json::Value::String(r.as_str().to_string()),
            Value::List(list) => {
                serde_json::Value::Array(list.into_iter().map(|v| v.into()).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_json_numbers_split() {
        let int: Value = json!(42).into();
        assert_eq!(int, Value::Int(42));

        let float: Value = json!(3.5).into();
        assert_eq!(float, Value::Float(3.5));

        let neg: Value = json!(-7).into();
        assert_eq!(neg, Value::Int(-7));
    }

    #[test]
    fn test_nested_object() {
        let v: Value = json!({
            "title": "A",
            "meta": { "likes": 3, "pinned": true }
        })
        .into();

        assert_eq!(v.get("title").and_then(|t| t.as_str()), Some("A"));
        let meta = v.get("meta").unwrap();
        assert_eq!(meta.get("likes").and_then(|l| l.as_int()), Some(3));
        assert_eq!(meta.get("pinned").and_then(|p| p.as_bool()), Some(true));
    }

    #[test]
    fn test_record_ref_from_string() {
        let v = Value::Str(SmolStr::new("thread:abc"));
        let id = v.as_record_id().unwrap();
        assert_eq!(id.table(), "thread");

        let plain = Value::Str(SmolStr::new("not a ref"));
        assert!(plain.as_record_id().is_none());
    }

    #[test]
    fn test_int_promotes_to_float() {
        assert_eq!(Value::Int(2).as_float(), Some(2.0));
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));
        assert!(Value::Str(SmolStr::new("2")).as_float().is_none());
    }

    #[test]
    fn test_json_roundtrip() {
        let original = json!({
            "id": "item:1",
            "val": 10,
            "score": 0.5,
            "tags": ["a", "b"],
            "nested": { "x": null }
        });
        let value: Value = original.clone().into();
        let back: serde_json::Value = value.into();
        assert_eq!(back, original);
    }

    #[test]
    fn test_record_variant_serializes_as_string_json() {
        let rec = Value::Record(RecordId::new("user", "7"));
        let j: serde_json::Value = rec.into();
        assert_eq!(j, json!("user:7"));
    }
}
