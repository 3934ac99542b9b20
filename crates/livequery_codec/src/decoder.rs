//! CBOR decoder producing [`Value`]s.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use ciborium::value::Value as Cbor;
use std::collections::BTreeMap;
use std::io::Cursor;

/// Largest input accepted by [`from_cbor`].
///
/// Frames come from the network, so the limit bounds allocation before
/// any structure is inspected.
pub const MAX_INPUT_BYTES: usize = 16 * 1024 * 1024;

/// Decode a value from CBOR bytes.
///
/// Accepts any well-formed CBOR within the value model; key order is not
/// validated since objects are re-sorted on decode.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR, contain trailing
/// data, or contain constructs outside the value model (tags, non-string
/// object keys, duplicate keys, NaN, integers outside `i64`).
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    if bytes.len() > MAX_INPUT_BYTES {
        return Err(CodecError::SizeLimitExceeded {
            claimed: bytes.len() as u64,
            max_allowed: MAX_INPUT_BYTES as u64,
        });
    }

    let mut cursor = Cursor::new(bytes);
    let cbor: Cbor = ciborium::de::from_reader(&mut cursor)
        .map_err(|e| CodecError::decoding_failed(e.to_string()))?;

    #[allow(clippy::cast_possible_truncation)]
    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - consumed,
        });
    }

    from_cbor_value(cbor)
}

/// Convert a decoded `ciborium` value into the value model.
pub(crate) fn from_cbor_value(cbor: Cbor) -> CodecResult<Value> {
    match cbor {
        Cbor::Null => Ok(Value::Null),
        Cbor::Bool(b) => Ok(Value::Bool(b)),
        Cbor::Integer(n) => i64::try_from(i128::from(n))
            .map(Value::Integer)
            .map_err(|_| CodecError::IntegerOverflow),
        Cbor::Float(f) if f.is_nan() => Err(CodecError::NaNForbidden),
        Cbor::Float(f) => Ok(Value::Float(f)),
        Cbor::Bytes(b) => Ok(Value::Bytes(b)),
        Cbor::Text(s) => Ok(Value::String(s)),
        Cbor::Array(items) => items
            .into_iter()
            .map(from_cbor_value)
            .collect::<CodecResult<Vec<_>>>()
            .map(Value::Array),
        Cbor::Map(pairs) => {
            let mut object = BTreeMap::new();
            for (key, value) in pairs {
                let key = match key {
                    Cbor::Text(s) => s,
                    other => {
                        return Err(CodecError::NonStringKey {
                            found: cbor_type_name(&other).to_string(),
                        })
                    }
                };
                if object.contains_key(&key) {
                    return Err(CodecError::DuplicateKey { key });
                }
                let value = from_cbor_value(value)?;
                object.insert(key, value);
            }
            Ok(Value::Object(object))
        }
        Cbor::Tag(tag, _) => Err(CodecError::unsupported_type(format!("tag {tag}"))),
        other => Err(CodecError::unsupported_type(cbor_type_name(&other))),
    }
}

fn cbor_type_name(value: &Cbor) -> &'static str {
    match value {
        Cbor::Null => "null",
        Cbor::Bool(_) => "bool",
        Cbor::Integer(_) => "integer",
        Cbor::Float(_) => "float",
        Cbor::Bytes(_) => "bytes",
        Cbor::Text(_) => "text",
        Cbor::Array(_) => "array",
        Cbor::Map(_) => "map",
        Cbor::Tag(..) => "tag",
        _ => "unknown",
    }
}
