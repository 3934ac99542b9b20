//! Canonical subscription identities.

use crate::error::{ProtocolError, ProtocolResult};
use livequery_codec::{to_canonical_cbor, Value};
use std::fmt;

/// Canonical key of a query subscription: function path plus arguments.
///
/// The argument half is the canonical CBOR encoding of the argument value,
/// so two calls with structurally equal arguments yield equal identities
/// regardless of object key order. This is the deduplication key of the
/// subscription registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryIdentity {
    function_path: String,
    canonical_args: Vec<u8>,
}

impl QueryIdentity {
    /// Computes the identity of `function_path` called with `args`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the arguments cannot be
    /// encoded (for example, they contain NaN).
    pub fn new(function_path: &str, args: &Value) -> ProtocolResult<Self> {
        validate_function_path(function_path)?;
        Ok(Self {
            function_path: function_path.to_string(),
            canonical_args: to_canonical_cbor(args)?,
        })
    }

    /// The function path half of the identity.
    pub fn function_path(&self) -> &str {
        &self.function_path
    }

    /// The canonical argument encoding.
    pub fn canonical_args(&self) -> &[u8] {
        &self.canonical_args
    }
}

impl fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})",
            self.function_path,
            hex::encode(&self.canonical_args)
        )
    }
}

/// Checks that a function path is non-empty and free of whitespace.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidArgument`] describing the problem.
pub fn validate_function_path(function_path: &str) -> ProtocolResult<()> {
    if function_path.is_empty() {
        return Err(ProtocolError::InvalidArgument(
            "function path must not be empty".into(),
        ));
    }
    if function_path.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidArgument(format!(
            "function path {function_path:?} must not contain whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn channel_args(channel: &str) -> Value {
        Value::object([("channel", Value::from(channel))])
    }

    #[test]
    fn equal_arguments_equal_identity() {
        let a = QueryIdentity::new(
            "messages.list",
            &Value::object([("channel", Value::from("general")), ("limit", Value::from(10))]),
        )
        .unwrap();
        let b = QueryIdentity::new(
            "messages.list",
            &Value::object([("limit", Value::from(10)), ("channel", Value::from("general"))]),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_path_or_args_differ() {
        let base = QueryIdentity::new("messages.list", &channel_args("general")).unwrap();
        let other_args = QueryIdentity::new("messages.list", &channel_args("random")).unwrap();
        let other_path = QueryIdentity::new("messages.count", &channel_args("general")).unwrap();
        assert_ne!(base, other_args);
        assert_ne!(base, other_path);
    }

    #[test]
    fn integer_and_float_are_distinct() {
        let int = QueryIdentity::new("f", &Value::Integer(1)).unwrap();
        let float = QueryIdentity::new("f", &Value::Float(1.0)).unwrap();
        assert_ne!(int, float);
    }

    #[test]
    fn invalid_paths_rejected() {
        assert!(QueryIdentity::new("", &Value::Null).is_err());
        assert!(QueryIdentity::new("messages list", &Value::Null).is_err());
        assert!(matches!(
            QueryIdentity::new("f", &Value::Float(f64::NAN)),
            Err(ProtocolError::Codec(_))
        ));
    }

    #[test]
    fn display_includes_path() {
        let id = QueryIdentity::new("messages.list", &Value::Null).unwrap();
        assert_eq!(id.to_string(), "messages.list(f6)");
    }

    proptest! {
        #[test]
        fn identity_ignores_key_order(
            pairs in prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..8)
        ) {
            let forward = Value::object(pairs.iter().map(|(k, v)| (k.clone(), Value::from(*v))));
            let reversed = Value::object(
                pairs.iter().rev().map(|(k, v)| (k.clone(), Value::from(*v))),
            );
            // Later duplicates win when building an object, so only compare
            // when both constructions agree on the contents.
            prop_assume!(forward == reversed);
            prop_assert_eq!(
                QueryIdentity::new("q", &forward).unwrap(),
                QueryIdentity::new("q", &reversed).unwrap()
            );
        }
    }
}
