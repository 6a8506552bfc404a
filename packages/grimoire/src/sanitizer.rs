//! Wire-boundary normalization.
//!
//! Mutations arrive as loose JSON. Before anything touches the engine the
//! record is folded into the canonical value shape in one pass: `{tb, id}`
//! objects collapse to `"table:id"` strings, stringified JSON payloads are
//! unwrapped, and record ids are validated against a fixed pattern.

use crate::engine::types::Value;
use lazy_static::lazy_static;
use regex::Regex;
use smol_str::SmolStr;

lazy_static! {
    static ref RECORD_ID_RE: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*:[A-Za-z0-9_\-]+$").expect("static pattern");
}

/// Whether a string is a well-formed `table:local_id` reference.
pub fn is_record_id(s: &str) -> bool {
    RECORD_ID_RE.is_match(s)
}

/// A string that looks like a JSON container got double-encoded somewhere
/// along the client path; recover the inner value if it parses.
fn reparse_payload(s: &str) -> Option<serde_json::Value> {
    let first = s.chars().next()?;
    let last = s.chars().last()?;
    if matches!((first, last), ('{', '}') | ('[', ']')) {
        serde_json::from_str(s).ok()
    } else {
        None
    }
}

/// The `table:id` form of a two-field `{tb, id}` reference object, if the
/// map is exactly that shape.
fn record_ref(map: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    if map.len() != 2 {
        return None;
    }
    let table = map.get("tb")?.as_str()?;
    let id = match map.get("id")? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    Some(format!("{}:{}", table, id))
}

/// Fold a raw JSON record into the engine's canonical value shape.
pub fn normalize_value(record: serde_json::Value) -> Value {
    match record {
        serde_json::Value::String(s) => match reparse_payload(&s) {
            Some(inner) => normalize_value(inner),
            None => Value::Str(SmolStr::from(s)),
        },
        serde_json::Value::Object(map) => match record_ref(&map) {
            Some(reference) => Value::Str(SmolStr::from(reference)),
            None => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (SmolStr::from(key), normalize_value(value)))
                    .collect(),
            ),
        },
        serde_json::Value::Array(items) => {
            Value::List(items.into_iter().map(normalize_value).collect())
        }
        scalar => Value::from(scalar),
    }
}

/// Normalize a raw JSON record, staying in JSON.
pub fn normalize_record(record: serde_json::Value) -> serde_json::Value {
    normalize_value(record).into()
}

/// Parse view params, tolerating a stringified JSON object.
pub fn parse_params(params: serde_json::Value) -> Option<Value> {
    match params {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(&s)
            .ok()
            .map(normalize_value),
        other => Some(normalize_value(other)),
    }
}
