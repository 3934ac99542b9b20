//! Canonical CBOR encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use ciborium::value::{Integer, Value as Cbor};
use std::cmp::Ordering;

/// Encode a value to canonical CBOR bytes.
///
/// Output is deterministic:
/// - Object keys are sorted by their encoded form (length-first, then bytewise)
/// - Integers use the shortest possible encoding
/// - No indefinite-length items
///
/// Structurally equal values therefore always produce identical bytes,
/// which is what subscription identities are built on.
///
/// # Errors
///
/// Returns an error if the value contains a NaN float.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let cbor = to_cbor_value(value)?;
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Convert a [`Value`] into a `ciborium` value with canonically ordered maps.
pub(crate) fn to_cbor_value(value: &Value) -> CodecResult<Cbor> {
    Ok(match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Integer(n) => Cbor::Integer(Integer::from(*n)),
        Value::Float(f) => {
            if f.is_nan() {
                return Err(CodecError::NaNForbidden);
            }
            Cbor::Float(*f)
        }
        Value::Bytes(b) => Cbor::Bytes(b.clone()),
        Value::String(s) => Cbor::Text(s.clone()),
        Value::Array(items) => Cbor::Array(
            items
                .iter()
                .map(to_cbor_value)
                .collect::<CodecResult<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| cmp_text_keys(a, b));
            let mut pairs = Vec::with_capacity(keys.len());
            for key in keys {
                // Present by construction: keys were taken from this map.
                if let Some(v) = map.get(key) {
                    pairs.push((Cbor::Text(key.clone()), to_cbor_value(v)?));
                }
            }
            Cbor::Map(pairs)
        }
    })
}

/// Canonical order of two text keys.
///
/// A text header grows with the string length, so comparing encoded keys
/// length-first reduces to comparing UTF-8 lengths, then bytes.
fn cmp_text_keys(a: &str, b: &str) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.as_bytes().cmp(b.as_bytes()),
        ord => ord,
    }
}
