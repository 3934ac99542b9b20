//! Fixtures for documents, arguments and hand-built server frames.
//!
//! The frame builders encode directly to [`Bytes`] so tests can feed
//! them to a client without a server in between. They panic on encoding
//! failure, which only happens for values the wire format forbids.

use bytes::Bytes;
use livequery_codec::Value;
use livequery_protocol::{
    DocumentChange, LogPosition, QueryId, RequestId, ServerFailure, ServerMessage,
    StateModification, DOCUMENT_ID_FIELD,
};

/// A chat message document.
pub fn message_doc(id: &str, channel: &str, body: &str) -> Value {
    Value::object([
        (DOCUMENT_ID_FIELD, Value::from(id)),
        ("channel", Value::from(channel)),
        ("body", Value::from(body)),
    ])
}

/// Arguments selecting one channel: `{channel}`.
pub fn channel_args(channel: &str) -> Value {
    Value::object([("channel", Value::from(channel))])
}

/// Arguments for `messages.send`: `{channel, body}`.
pub fn send_args(channel: &str, body: &str) -> Value {
    Value::object([
        ("channel", Value::from(channel)),
        ("body", Value::from(body)),
    ])
}

/// `Updated` modification.
pub fn updated(query_id: u32, value: Value) -> StateModification {
    StateModification::Updated {
        query_id: QueryId::new(query_id),
        value,
    }
}

/// `Patched` modification.
pub fn patched(query_id: u32, changes: Vec<DocumentChange>) -> StateModification {
    StateModification::Patched {
        query_id: QueryId::new(query_id),
        changes,
    }
}

/// `Failed` modification.
pub fn failed(query_id: u32, message: &str) -> StateModification {
    StateModification::Failed {
        query_id: QueryId::new(query_id),
        message: message.to_string(),
    }
}

/// Upsert of a document keyed by its own `_id`.
///
/// # Panics
///
/// Panics if the document has no string `_id`.
pub fn upsert(document: Value) -> DocumentChange {
    let id = document
        .get(DOCUMENT_ID_FIELD)
        .and_then(Value::as_str)
        .expect("document without _id")
        .to_string();
    DocumentChange::Upsert { id, document }
}

/// Removal of the document with `id`.
pub fn remove(id: &str) -> DocumentChange {
    DocumentChange::Remove { id: id.to_string() }
}

/// Encodes a server message.
///
/// # Panics
///
/// Panics if the message cannot be encoded.
pub fn frame(message: &ServerMessage) -> Bytes {
    Bytes::from(message.encode().expect("encode server message"))
}

/// Transition frame at `position`.
pub fn transition_frame(position: u64, modifications: Vec<StateModification>) -> Bytes {
    frame(&ServerMessage::Transition {
        position: LogPosition::new(position),
        modifications,
    })
}

/// Successful mutation response, optionally tied to a position.
pub fn mutation_ok_frame(request_id: u64, value: Value, position: Option<u64>) -> Bytes {
    frame(&ServerMessage::MutationResponse {
        request_id: RequestId::new(request_id),
        outcome: Ok(value),
        position: position.map(LogPosition::new),
    })
}

/// Failed mutation response.
pub fn mutation_err_frame(request_id: u64, message: &str) -> Bytes {
    frame(&ServerMessage::MutationResponse {
        request_id: RequestId::new(request_id),
        outcome: Err(ServerFailure::new(message)),
        position: None,
    })
}

/// Successful action response.
pub fn action_ok_frame(request_id: u64, value: Value) -> Bytes {
    frame(&ServerMessage::ActionResponse {
        request_id: RequestId::new(request_id),
        outcome: Ok(value),
    })
}

/// Authentication error frame.
pub fn auth_error_frame(reason: &str) -> Bytes {
    frame(&ServerMessage::AuthError {
        reason: reason.to_string(),
    })
}

/// Pong frame.
pub fn pong_frame() -> Bytes {
    frame(&ServerMessage::Pong)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_doc_has_id() {
        let doc = message_doc("m1", "general", "hello");
        assert_eq!(doc.get("_id"), Some(&Value::from("m1")));
        assert_eq!(upsert(doc.clone()), DocumentChange::Upsert {
            id: "m1".into(),
            document: doc,
        });
    }

    #[test]
    fn frames_decode() {
        let bytes = transition_frame(3, vec![updated(1, Value::Null)]);
        assert_eq!(
            ServerMessage::decode(&bytes).unwrap(),
            ServerMessage::Transition {
                position: LogPosition::new(3),
                modifications: vec![updated(1, Value::Null)],
            }
        );
        assert_eq!(ServerMessage::decode(&pong_frame()).unwrap(), ServerMessage::Pong);
    }
}
