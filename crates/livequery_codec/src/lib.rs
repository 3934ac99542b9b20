//! # LiveQuery Codec
//!
//! Value model and canonical CBOR encoding for the LiveQuery sync client.
//!
//! The value model is a restricted JSON superset: null, boolean, integer,
//! float, string, byte string, ordered list and mapping with string keys.
//! Encoding is deterministic:
//! - Identical values produce identical bytes
//! - Object key order never affects the output
//! - NaN is rejected
//!
//! Determinism is what makes the encoding usable as the argument half of
//! a subscription identity.
//!
//! ## Usage
//!
//! ```
//! use livequery_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let args = Value::object([("channel", Value::from("general"))]);
//! let bytes = to_canonical_cbor(&args).unwrap();
//!
//! let decoded = from_cbor(&bytes).unwrap();
//! assert_eq!(args, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod json;
mod value;

pub use decoder::{from_cbor, MAX_INPUT_BYTES};
pub use encoder::to_canonical_cbor;
pub use error::{CodecError, CodecResult};
pub use value::Value;

/// Trait for types that can be encoded to canonical CBOR.
pub trait Encode {
    /// Encode this value to canonical CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            any::<f64>()
                .prop_filter("NaN has no encoding", |f| !f.is_nan())
                .prop_map(Value::Float),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Object),
            ]
        })
    }

    #[test]
    fn nested_document_survives_encoding() {
        let value = Value::object([
            (
                "users",
                Value::Array(vec![
                    Value::object([("name", Value::from("Alice")), ("age", Value::from(30))]),
                    Value::object([("name", Value::from("Bob")), ("score", Value::from(2.5))]),
                ]),
            ),
            ("avatar", Value::Bytes(vec![0, 1, 2])),
            ("next", Value::Null),
        ]);
        let bytes = value.encode().unwrap();
        assert_eq!(Value::decode(&bytes).unwrap(), value);
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(value in arb_value()) {
            let bytes = to_canonical_cbor(&value).unwrap();
            prop_assert_eq!(from_cbor(&bytes).unwrap(), value);
        }

        #[test]
        fn encoding_is_stable(value in arb_value()) {
            let once = to_canonical_cbor(&value).unwrap();
            let again = to_canonical_cbor(&from_cbor(&once).unwrap()).unwrap();
            prop_assert_eq!(once, again);
        }
    }
}
