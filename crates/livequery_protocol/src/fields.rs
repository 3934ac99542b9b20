//! Typed field access over decoded CBOR maps.

use crate::error::{ProtocolError, ProtocolResult};
use livequery_codec::Value;
use std::collections::BTreeMap;

/// Read-only view of a decoded map that reports errors against a context
/// name (usually the message type).
pub(crate) struct Fields<'a> {
    context: &'a str,
    map: &'a BTreeMap<String, Value>,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(context: &'a str, value: &'a Value) -> ProtocolResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            ProtocolError::invalid_field(context, "<root>", "a map")
        })?;
        Ok(Self { context, map })
    }

    pub(crate) fn optional(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|v| !v.is_null())
    }

    pub(crate) fn required(&self, name: &str) -> ProtocolResult<&'a Value> {
        self.map
            .get(name)
            .ok_or_else(|| ProtocolError::missing_field(self.context, name))
    }

    pub(crate) fn string(&self, name: &str) -> ProtocolResult<String> {
        self.required(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(name, "a string"))
    }

    pub(crate) fn optional_string(&self, name: &str) -> ProtocolResult<Option<String>> {
        match self.optional(name) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| self.invalid(name, "a string or null")),
        }
    }

    pub(crate) fn u64(&self, name: &str) -> ProtocolResult<u64> {
        value_to_u64(self.required(name)?).ok_or_else(|| self.invalid(name, "a non-negative integer"))
    }

    pub(crate) fn optional_u64(&self, name: &str) -> ProtocolResult<Option<u64>> {
        match self.optional(name) {
            None => Ok(None),
            Some(v) => value_to_u64(v)
                .map(Some)
                .ok_or_else(|| self.invalid(name, "a non-negative integer or null")),
        }
    }

    pub(crate) fn u32(&self, name: &str) -> ProtocolResult<u32> {
        let raw = self.u64(name)?;
        u32::try_from(raw).map_err(|_| self.invalid(name, "an integer below 2^32"))
    }

    pub(crate) fn array(&self, name: &str) -> ProtocolResult<&'a [Value]> {
        self.required(name)?
            .as_array()
            .ok_or_else(|| self.invalid(name, "an array"))
    }

    pub(crate) fn invalid(&self, name: &str, expected: &str) -> ProtocolError {
        ProtocolError::invalid_field(self.context, name, expected)
    }
}

fn value_to_u64(value: &Value) -> Option<u64> {
    value.as_integer().and_then(|n| u64::try_from(n).ok())
}

/// Converts an unsigned identifier into a wire integer.
pub(crate) fn u64_to_value(context: &str, field: &str, raw: u64) -> ProtocolResult<Value> {
    i64::try_from(raw)
        .map(Value::Integer)
        .map_err(|_| ProtocolError::invalid_field(context, field, "an integer below 2^63"))
}
