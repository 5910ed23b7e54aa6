//! Conversion between plain JSON and Firestore's typed value encoding.
//!
//! Firestore's REST API wraps every value in a single-key object naming its
//! type (`{"stringValue": "x"}`, `{"integerValue": "42"}`, ...). The rest of
//! the crate works with plain `serde_json` values; this module is the only
//! place that knows the wire encoding.

use serde_json::{json, Map, Number, Value};

use super::{BackendError, Fields, TIMESTAMP_KEY};

/// Encode plain fields as a Firestore `fields` object
pub fn encode_fields(fields: &Fields) -> Value {
    let encoded: Map<String, Value> = fields
        .iter()
        .map(|(key, value)| (key.clone(), encode(value)))
        .collect();
    Value::Object(encoded)
}

/// Encode a single plain JSON value
pub fn encode(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            // Firestore transports 64-bit integers as strings
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => match timestamp_marker(map) {
            Some(time) => json!({ "timestampValue": time }),
            None => json!({ "mapValue": { "fields": encode_fields(map) } }),
        },
    }
}

fn timestamp_marker(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get(TIMESTAMP_KEY)?.as_str()
}

/// Decode a Firestore `fields` object; a missing object decodes as empty
pub fn decode_fields(fields: Option<&Value>) -> Result<Fields, BackendError> {
    let Some(fields) = fields else {
        return Ok(Fields::new());
    };
    let object = fields
        .as_object()
        .ok_or_else(|| BackendError::Parse("document fields are not an object".into()))?;

    object
        .iter()
        .map(|(key, value)| Ok((key.clone(), decode(value)?)))
        .collect()
}

/// Decode a single Firestore typed value
pub fn decode(value: &Value) -> Result<Value, BackendError> {
    let object = value
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| BackendError::Parse(format!("not a typed value: {value}")))?;

    let (kind, inner) = object
        .iter()
        .next()
        .ok_or_else(|| BackendError::Parse("empty typed value".into()))?;

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| type_mismatch(kind, inner)),
        "integerValue" => {
            // Usually a string, but accept a bare number too
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            parsed
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| type_mismatch(kind, inner))
        }
        "doubleValue" => inner
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| type_mismatch(kind, inner)),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| type_mismatch(kind, inner)),
        "geoPointValue" => Ok(inner.clone()),
        "arrayValue" => match inner.get("values") {
            None => Ok(Value::Array(Vec::new())),
            Some(Value::Array(values)) => values
                .iter()
                .map(decode)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Some(other) => Err(type_mismatch(kind, other)),
        },
        "mapValue" => decode_fields(inner.get("fields")).map(Value::Object),
        other => Err(BackendError::Parse(format!("unknown Firestore value type: {other}"))),
    }
}

fn type_mismatch(kind: &str, inner: &Value) -> BackendError {
    BackendError::Parse(format!("malformed {kind}: {inner}"))
}
