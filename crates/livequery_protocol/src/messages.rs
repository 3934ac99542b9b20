//! Wire messages exchanged with the server.
//!
//! Every message is one binary frame holding a canonical CBOR map with a
//! `"type"` text tag plus per-type fields.

use crate::error::{ProtocolError, ProtocolResult};
use crate::fields::{u64_to_value, Fields};
use crate::ids::{LogPosition, QueryId, RequestId};
use crate::modification::StateModification;
use livequery_codec::{from_cbor, to_canonical_cbor, Value};

/// One query the client asks the server to start evaluating.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySubscription {
    /// Client-assigned query ID.
    pub query_id: QueryId,
    /// Server function path.
    pub function_path: String,
    /// Function arguments.
    pub args: Value,
}

impl QuerySubscription {
    /// Creates a subscription entry.
    pub fn new(query_id: QueryId, function_path: impl Into<String>, args: Value) -> Self {
        Self {
            query_id,
            function_path: function_path.into(),
            args,
        }
    }

    fn to_value(&self) -> Value {
        Value::object([
            ("query_id", Value::from(self.query_id.get())),
            ("function_path", Value::from(self.function_path.as_str())),
            ("args", self.args.clone()),
        ])
    }

    fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::new("subscription", value)?;
        Ok(Self {
            query_id: QueryId::new(fields.u32("query_id")?),
            function_path: fields.string("function_path")?,
            args: fields.required("args")?.clone(),
        })
    }
}

/// Application-level failure reported by a server function.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFailure {
    /// Human-readable error message.
    pub message: String,
    /// Optional structured error payload.
    pub data: Option<Value>,
}

impl ServerFailure {
    /// Creates a failure with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured error data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Result of a mutation or action as reported by the server.
pub type Outcome = Result<Value, ServerFailure>;

fn outcome_to_value(outcome: &Outcome) -> Value {
    match outcome {
        Ok(value) => Value::object([("ok", value.clone())]),
        Err(failure) => {
            let mut pairs = vec![("error", Value::from(failure.message.as_str()))];
            if let Some(data) = &failure.data {
                pairs.push(("data", data.clone()));
            }
            Value::object(pairs)
        }
    }
}

fn outcome_from_value(value: &Value) -> ProtocolResult<Outcome> {
    let fields = Fields::new("outcome", value)?;
    if let Some(ok) = value.get("ok") {
        return Ok(Ok(ok.clone()));
    }
    let message = fields.string("error")?;
    Ok(Err(ServerFailure {
        message,
        data: fields.optional("data").cloned(),
    }))
}

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Presents (or clears) the authentication token.
    Authenticate {
        /// Opaque token, `None` to clear.
        token: Option<String>,
    },
    /// Adds and removes query subscriptions in one batch.
    ModifySubscriptions {
        /// Queries to start.
        add: Vec<QuerySubscription>,
        /// Queries to stop.
        remove: Vec<QueryId>,
    },
    /// Requests a transactional write.
    Mutation {
        /// Client-assigned request ID.
        request_id: RequestId,
        /// Server function path.
        function_path: String,
        /// Function arguments.
        args: Value,
    },
    /// Requests a non-transactional server call.
    Action {
        /// Client-assigned request ID.
        request_id: RequestId,
        /// Server function path.
        function_path: String,
        /// Function arguments.
        args: Value,
    },
    /// Liveness probe.
    Ping,
}

impl ClientMessage {
    /// Wire tag of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::ModifySubscriptions { .. } => "modify_subscriptions",
            ClientMessage::Mutation { .. } => "mutation",
            ClientMessage::Action { .. } => "action",
            ClientMessage::Ping => "ping",
        }
    }

    /// Request ID for mutations and actions.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Mutation { request_id, .. } | ClientMessage::Action { request_id, .. } => {
                Some(*request_id)
            }
            _ => None,
        }
    }

    /// Encodes to a CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error if an argument value cannot be encoded or an ID
    /// exceeds the wire integer range.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let tag = self.type_name();
        let mut pairs = vec![("type", Value::from(tag))];
        match self {
            ClientMessage::Authenticate { token } => {
                pairs.push(("token", Value::from(token.clone())));
            }
            ClientMessage::ModifySubscriptions { add, remove } => {
                pairs.push((
                    "add",
                    Value::Array(add.iter().map(QuerySubscription::to_value).collect()),
                ));
                pairs.push((
                    "remove",
                    Value::Array(remove.iter().map(|id| Value::from(id.get())).collect()),
                ));
            }
            ClientMessage::Mutation {
                request_id,
                function_path,
                args,
            }
            | ClientMessage::Action {
                request_id,
                function_path,
                args,
            } => {
                pairs.push(("request_id", u64_to_value(tag, "request_id", request_id.get())?));
                pairs.push(("function_path", Value::from(function_path.as_str())));
                pairs.push(("args", args.clone()));
            }
            ClientMessage::Ping => {}
        }
        Ok(to_canonical_cbor(&Value::object(pairs))?)
    }

    /// Decodes from a CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error for undecodable bytes, unknown tags, or missing
    /// or mistyped fields.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = from_cbor(bytes)?;
        let tag = message_tag(&value)?;
        let fields = Fields::new(&tag, &value)?;
        match tag.as_str() {
            "authenticate" => Ok(ClientMessage::Authenticate {
                token: fields.optional_string("token")?,
            }),
            "modify_subscriptions" => {
                let add = fields
                    .array("add")?
                    .iter()
                    .map(QuerySubscription::from_value)
                    .collect::<ProtocolResult<Vec<_>>>()?;
                let remove = fields
                    .array("remove")?
                    .iter()
                    .map(|v| {
                        v.as_integer()
                            .and_then(|n| u32::try_from(n).ok())
                            .map(QueryId::new)
                            .ok_or_else(|| fields.invalid("remove", "an array of query ids"))
                    })
                    .collect::<ProtocolResult<Vec<_>>>()?;
                Ok(ClientMessage::ModifySubscriptions { add, remove })
            }
            "mutation" => Ok(ClientMessage::Mutation {
                request_id: RequestId::new(fields.u64("request_id")?),
                function_path: fields.string("function_path")?,
                args: fields.required("args")?.clone(),
            }),
            "action" => Ok(ClientMessage::Action {
                request_id: RequestId::new(fields.u64("request_id")?),
                function_path: fields.string("function_path")?,
                args: fields.required("args")?.clone(),
            }),
            "ping" => Ok(ClientMessage::Ping),
            _ => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Ordered batch of query result changes at a log position.
    Transition {
        /// Position the client reaches after applying the batch.
        position: LogPosition,
        /// Changes, applied in order.
        modifications: Vec<StateModification>,
    },
    /// Outcome of a mutation.
    MutationResponse {
        /// Request being answered.
        request_id: RequestId,
        /// Success value or failure.
        outcome: Outcome,
        /// Position whose transition includes the mutation's effects.
        position: Option<LogPosition>,
    },
    /// Outcome of an action.
    ActionResponse {
        /// Request being answered.
        request_id: RequestId,
        /// Success value or failure.
        outcome: Outcome,
    },
    /// The presented token was rejected.
    AuthError {
        /// Server-supplied reason.
        reason: String,
    },
    /// Reply to a ping.
    Pong,
}

impl ServerMessage {
    /// Wire tag of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Transition { .. } => "transition",
            ServerMessage::MutationResponse { .. } => "mutation_response",
            ServerMessage::ActionResponse { .. } => "action_response",
            ServerMessage::AuthError { .. } => "auth_error",
            ServerMessage::Pong => "pong",
        }
    }

    /// Encodes to a CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be encoded or an ID exceeds the
    /// wire integer range.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let tag = self.type_name();
        let mut pairs = vec![("type", Value::from(tag))];
        match self {
            ServerMessage::Transition {
                position,
                modifications,
            } => {
                pairs.push(("position", u64_to_value(tag, "position", position.get())?));
                pairs.push((
                    "modifications",
                    Value::Array(
                        modifications
                            .iter()
                            .map(StateModification::to_value)
                            .collect(),
                    ),
                ));
            }
            ServerMessage::MutationResponse {
                request_id,
                outcome,
                position,
            } => {
                pairs.push(("request_id", u64_to_value(tag, "request_id", request_id.get())?));
                pairs.push(("outcome", outcome_to_value(outcome)));
                if let Some(position) = position {
                    pairs.push(("position", u64_to_value(tag, "position", position.get())?));
                }
            }
            ServerMessage::ActionResponse {
                request_id,
                outcome,
            } => {
                pairs.push(("request_id", u64_to_value(tag, "request_id", request_id.get())?));
                pairs.push(("outcome", outcome_to_value(outcome)));
            }
            ServerMessage::AuthError { reason } => {
                pairs.push(("reason", Value::from(reason.as_str())));
            }
            ServerMessage::Pong => {}
        }
        Ok(to_canonical_cbor(&Value::object(pairs))?)
    }

    /// Decodes from a CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error for undecodable bytes, unknown tags, or missing
    /// or mistyped fields.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = from_cbor(bytes)?;
        let tag = message_tag(&value)?;
        let fields = Fields::new(&tag, &value)?;
        match tag.as_str() {
            "transition" => {
                let modifications = fields
                    .array("modifications")?
                    .iter()
                    .map(StateModification::from_value)
                    .collect::<ProtocolResult<Vec<_>>>()?;
                Ok(ServerMessage::Transition {
                    position: LogPosition::new(fields.u64("position")?),
                    modifications,
                })
            }
            "mutation_response" => Ok(ServerMessage::MutationResponse {
                request_id: RequestId::new(fields.u64("request_id")?),
                outcome: outcome_from_value(fields.required("outcome")?)?,
                position: fields.optional_u64("position")?.map(LogPosition::new),
            }),
            "action_response" => Ok(ServerMessage::ActionResponse {
                request_id: RequestId::new(fields.u64("request_id")?),
                outcome: outcome_from_value(fields.required("outcome")?)?,
            }),
            "auth_error" => Ok(ServerMessage::AuthError {
                reason: fields.string("reason")?,
            }),
            "pong" => Ok(ServerMessage::Pong),
            _ => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

fn message_tag(value: &Value) -> ProtocolResult<String> {
    Fields::new("message", value)?.string("type")
}
