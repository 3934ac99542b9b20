//! Per-query modifications carried by a transition.

use crate::error::{ProtocolError, ProtocolResult};
use crate::fields::Fields;
use crate::ids::QueryId;
use livequery_codec::Value;

/// Name of the field that keys documents inside a patched result set.
pub const DOCUMENT_ID_FIELD: &str = "_id";

/// One change to the result of a single subscribed query.
#[derive(Debug, Clone, PartialEq)]
pub enum StateModification {
    /// The result is replaced wholesale.
    Updated {
        /// Target query.
        query_id: QueryId,
        /// New result value.
        value: Value,
    },
    /// Document-level changes to an array-of-documents result.
    Patched {
        /// Target query.
        query_id: QueryId,
        /// Changes applied in order.
        changes: Vec<DocumentChange>,
    },
    /// The query function failed on the server.
    Failed {
        /// Target query.
        query_id: QueryId,
        /// Application error message.
        message: String,
    },
    /// Acknowledges that the server dropped the query.
    Removed {
        /// Target query.
        query_id: QueryId,
    },
}

impl StateModification {
    /// The query this modification targets.
    pub fn query_id(&self) -> QueryId {
        match self {
            StateModification::Updated { query_id, .. }
            | StateModification::Patched { query_id, .. }
            | StateModification::Failed { query_id, .. }
            | StateModification::Removed { query_id } => *query_id,
        }
    }

    /// Wire name of the modification kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StateModification::Updated { .. } => "updated",
            StateModification::Patched { .. } => "patched",
            StateModification::Failed { .. } => "failed",
            StateModification::Removed { .. } => "removed",
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut pairs = vec![
            ("query_id", Value::from(self.query_id().get())),
            ("kind", Value::from(self.kind_name())),
        ];
        match self {
            StateModification::Updated { value, .. } => pairs.push(("value", value.clone())),
            StateModification::Patched { changes, .. } => pairs.push((
                "changes",
                Value::Array(changes.iter().map(DocumentChange::to_value).collect()),
            )),
            StateModification::Failed { message, .. } => {
                pairs.push(("message", Value::from(message.as_str())));
            }
            StateModification::Removed { .. } => {}
        }
        Value::object(pairs)
    }

    pub(crate) fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::new("modification", value)?;
        let query_id = QueryId::new(fields.u32("query_id")?);
        let kind = fields.string("kind")?;
        match kind.as_str() {
            "updated" => Ok(StateModification::Updated {
                query_id,
                value: fields.required("value")?.clone(),
            }),
            "patched" => {
                let changes = fields
                    .array("changes")?
                    .iter()
                    .map(DocumentChange::from_value)
                    .collect::<ProtocolResult<Vec<_>>>()?;
                Ok(StateModification::Patched { query_id, changes })
            }
            "failed" => Ok(StateModification::Failed {
                query_id,
                message: fields.string("message")?,
            }),
            "removed" => Ok(StateModification::Removed { query_id }),
            _ => Err(fields.invalid("kind", "one of updated, patched, failed, removed")),
        }
    }
}

/// A document-level change inside a patched result set.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    /// Replace the document with this `_id`, or append it if absent.
    Upsert {
        /// Document key.
        id: String,
        /// Full replacement document.
        document: Value,
    },
    /// Delete the document with this `_id`, if present.
    Remove {
        /// Document key.
        id: String,
    },
}

impl DocumentChange {
    /// The document key this change targets.
    pub fn id(&self) -> &str {
        match self {
            DocumentChange::Upsert { id, .. } | DocumentChange::Remove { id } => id,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            DocumentChange::Upsert { id, document } => Value::object([
                ("op", Value::from("upsert")),
                ("id", Value::from(id.as_str())),
                ("document", document.clone()),
            ]),
            DocumentChange::Remove { id } => Value::object([
                ("op", Value::from("remove")),
                ("id", Value::from(id.as_str())),
            ]),
        }
    }

    fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::new("document change", value)?;
        let id = fields.string("id")?;
        match fields.string("op")?.as_str() {
            "upsert" => {
                let document = fields.required("document")?.clone();
                if document.as_object().is_none() {
                    return Err(ProtocolError::invalid_field(
                        "document change",
                        "document",
                        "a map",
                    ));
                }
                Ok(DocumentChange::Upsert { id, document })
            }
            "remove" => Ok(DocumentChange::Remove { id }),
            _ => Err(fields.invalid("op", "upsert or remove")),
        }
    }
}
