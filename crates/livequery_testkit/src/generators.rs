//! Property-based test generators using proptest.

use livequery_codec::Value;
use livequery_protocol::DOCUMENT_ID_FIELD;
use proptest::prelude::*;

/// Strategy for scalar values. Floats are finite.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9f64..1.0e9f64).prop_map(Value::Float),
        "[a-z0-9 ]{0,16}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
    ]
}

/// Strategy for nested values up to a small depth.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Object),
        ]
    })
}

/// Strategy for argument objects as key/value pairs.
///
/// Keys are unique, so any permutation of the pairs describes the same
/// object.
pub fn args_pairs_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map("[a-z]{1,8}", value_strategy(), 0..6)
        .prop_map(|map| map.into_iter().collect())
}

/// Strategy for argument pairs together with a shuffled copy.
pub fn shuffled_args_strategy(
) -> impl Strategy<Value = (Vec<(String, Value)>, Vec<(String, Value)>)> {
    args_pairs_strategy().prop_flat_map(|pairs| {
        let shuffled = Just(pairs.clone()).prop_shuffle();
        (Just(pairs), shuffled)
    })
}

/// Strategy for dotted function paths like `messages.list`.
pub fn function_path_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}"
}

/// Strategy for documents with a fixed `_id`.
pub fn document_strategy(id: String) -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", scalar_strategy(), 0..4).prop_map(move |mut map| {
        map.insert(DOCUMENT_ID_FIELD.to_string(), Value::from(id.as_str()));
        Value::Object(map)
    })
}

/// Strategy for a result set of documents with distinct ids.
pub fn document_set_strategy() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::btree_set("[a-z]{1,4}", 0..6).prop_flat_map(|ids| {
        ids.into_iter()
            .map(document_strategy)
            .collect::<Vec<_>>()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn shuffled_args_build_same_object((pairs, shuffled) in shuffled_args_strategy()) {
            prop_assert_eq!(Value::object(pairs), Value::object(shuffled));
        }

        #[test]
        fn document_sets_have_ids(docs in document_set_strategy()) {
            for doc in &docs {
                prop_assert!(doc.get(DOCUMENT_ID_FIELD).and_then(Value::as_str).is_some());
            }
        }

        #[test]
        fn values_encode(value in value_strategy()) {
            prop_assert!(livequery_codec::to_canonical_cbor(&value).is_ok());
        }
    }
}
