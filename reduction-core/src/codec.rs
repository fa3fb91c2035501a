//! Bundle/value codec (C7).
//!
//! Bundles serialize to `{ "datatype": id, "values": [...] }`. `Value`
//! itself cannot represent a non-finite float — `serde_json`'s own
//! `From<f64>`/`Number::from_f64` collapse `NaN`/`+Inf`/`-Inf` to
//! `Value::Null` the moment one is converted, and there is no way back:
//! a `Value` that started out infinite and one that started out null are
//! indistinguishable. So a non-finite float can only survive as a
//! `Value` if it's never handed to `Value::from`/`json!` at all — instead
//! [`float_to_value`] substitutes a sentinel string for it up front. That
//! sentinel string *is* the bundle's on-the-wire and in-memory
//! representation; encoding and decoding a cached bundle do not rewrite
//! it further. [`value_to_float`] is the inverse accessor for code that
//! needs the underlying `f64` back (mirroring `float_to_value` exactly,
//! since a `Value`-shaped sentinel can't be un-sentineled into another
//! `Value`).

use serde_json::{Map, Value};

use crate::error::EngineResult;
use crate::registry::{Bundle, Registry};

const INF_STRING: &str = "\u{221E}";
const MINUS_INF_STRING: &str = "-\u{221E}";
const NAN_STRING: &str = "\u{26A0}";

/// Converts an `f64` to its bundle-safe `Value`: `NaN -> "⚠"`,
/// `+Inf -> "∞"`, `-Inf -> "-∞"`, anything finite passes through
/// `Value::from` unchanged.
pub fn float_to_value(f: f64) -> Value {
    if f.is_nan() {
        Value::String(NAN_STRING.to_string())
    } else if f == f64::INFINITY {
        Value::String(INF_STRING.to_string())
    } else if f == f64::NEG_INFINITY {
        Value::String(MINUS_INF_STRING.to_string())
    } else {
        Value::from(f)
    }
}

/// Recovers the `f64` a bundle value represents: an ordinary finite
/// `Value::Number`, or one of `float_to_value`'s three sentinel strings.
/// `None` for anything else.
pub fn value_to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s == INF_STRING => Some(f64::INFINITY),
        Value::String(s) if s == MINUS_INF_STRING => Some(f64::NEG_INFINITY),
        Value::String(s) if s == NAN_STRING => Some(f64::NAN),
        _ => None,
    }
}

/// Encodes a `{ terminal-id -> Bundle }` map to the UTF-8 JSON cache byte
/// layout. Bundle values are already JSON-safe by construction (see
/// [`float_to_value`]), so no rewriting happens here.
pub fn encode_outputs(outputs: &std::collections::BTreeMap<String, Bundle>) -> EngineResult<Vec<u8>> {
    let mut map = Map::new();
    for (terminal_id, bundle) in outputs {
        map.insert(
            terminal_id.clone(),
            serde_json::json!({ "datatype": bundle.datatype, "values": bundle.values }),
        );
    }
    Ok(serde_json::to_vec(&Value::Object(map))?)
}

/// Decodes the bytes produced by `encode_outputs` back into bundles,
/// validating each datatype id against `registry`. Values come back
/// exactly as encoded — any sentinel strings are read with
/// [`value_to_float`] by whoever needs the underlying number.
pub fn decode_outputs(
    registry: &Registry,
    bytes: &[u8],
) -> EngineResult<std::collections::BTreeMap<String, Bundle>> {
    let parsed: Value = serde_json::from_slice(bytes)?;
    let map = parsed
        .as_object()
        .ok_or_else(|| crate::error::EngineError::Validation {
            message: "cached bundle map is not a JSON object".to_string(),
        })?;

    let mut outputs = std::collections::BTreeMap::new();
    for (terminal_id, entry) in map {
        let datatype = entry["datatype"]
            .as_str()
            .ok_or_else(|| crate::error::EngineError::Validation {
                message: format!("terminal '{terminal_id}': missing datatype"),
            })?
            .to_string();
        registry.lookup_datatype(&datatype)?;

        let values = entry["values"]
            .as_array()
            .ok_or_else(|| crate::error::EngineError::Validation {
                message: format!("terminal '{terminal_id}': missing values"),
            })?
            .clone();

        outputs.insert(terminal_id.clone(), Bundle::new(datatype, values));
    }
    Ok(outputs)
}
