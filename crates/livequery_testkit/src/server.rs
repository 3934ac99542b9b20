//! In-memory fake server speaking the wire protocol.
//!
//! [`FakeServer`] decodes client frames, evaluates registered query,
//! mutation and action functions against a small table store, and
//! answers with encoded server frames. Tests shuttle frames between a
//! client transport and the server by hand, which keeps every exchange
//! deterministic.

use bytes::Bytes;
use livequery_codec::Value;
use livequery_protocol::{
    ClientMessage, DocumentChange, LogPosition, Outcome, ProtocolResult, QueryId, ServerFailure,
    ServerMessage, StateModification, DOCUMENT_ID_FIELD,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Documents grouped by table name.
pub type Tables = BTreeMap<String, Vec<Value>>;

/// Read-only query function.
pub type QueryFn = Box<dyn Fn(&Tables, &Value) -> Result<Value, String> + Send>;

/// Transactional write function.
pub type MutationFn = Box<dyn Fn(&mut Tables, &Value) -> Outcome + Send>;

/// Non-transactional function.
pub type ActionFn = Box<dyn Fn(&Value) -> Outcome + Send>;

/// How result changes are shipped to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultEncoding {
    /// Every change is a full `Updated` replacement.
    #[default]
    Replace,
    /// Array-of-documents results are diffed into `Patched` changes.
    Patch,
}

/// Relative order of a mutation response and its transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseOrder {
    /// The response arrives before the transition carrying its effects.
    #[default]
    ResponseFirst,
    /// The transition arrives first.
    TransitionFirst,
}

#[derive(Debug)]
struct ServerQuery {
    function_path: String,
    args: Value,
    last: Option<Result<Value, String>>,
}

#[derive(Debug, Default)]
struct Session {
    position: LogPosition,
    token: Option<String>,
    queries: BTreeMap<QueryId, ServerQuery>,
}

/// A single-connection fake server.
pub struct FakeServer {
    queries: HashMap<String, QueryFn>,
    mutations: HashMap<String, MutationFn>,
    actions: HashMap<String, ActionFn>,
    tables: Tables,
    session: Session,
    sessions: u32,
    rejected_tokens: HashSet<String>,
    received: Vec<ClientMessage>,
    encoding: ResultEncoding,
    order: ResponseOrder,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    /// Creates a server with no functions and empty tables.
    pub fn new() -> Self {
        Self {
            queries: HashMap::new(),
            mutations: HashMap::new(),
            actions: HashMap::new(),
            tables: Tables::new(),
            session: Session::default(),
            sessions: 0,
            rejected_tokens: HashSet::new(),
            received: Vec::new(),
            encoding: ResultEncoding::default(),
            order: ResponseOrder::default(),
        }
    }

    /// Creates a server hosting a small chat application.
    ///
    /// - `messages.list` `{channel}`: messages of one channel, in insertion order.
    /// - `messages.send` `{channel, body}`: appends a message and returns its `_id`.
    /// - `messages.fail`: always fails with `"rejected"`.
    /// - `echo` (action): returns its arguments.
    pub fn with_messages() -> Self {
        let mut server = Self::new();
        server.register_query("messages.list", |tables, args| {
            let channel = args
                .get("channel")
                .and_then(Value::as_str)
                .ok_or_else(|| "missing channel".to_string())?;
            let docs: Vec<Value> = tables
                .get("messages")
                .map(|docs| {
                    docs.iter()
                        .filter(|doc| doc.get("channel").and_then(Value::as_str) == Some(channel))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(Value::Array(docs))
        });
        server.register_mutation("messages.send", |tables, args| {
            let channel = args.get("channel").cloned().unwrap_or(Value::Null);
            let body = args.get("body").cloned().unwrap_or(Value::Null);
            let docs = tables.entry("messages".to_string()).or_default();
            let id = format!("m{}", docs.len() + 1);
            docs.push(Value::object([
                (DOCUMENT_ID_FIELD, Value::from(id.as_str())),
                ("channel", channel),
                ("body", body),
            ]));
            Ok(Value::from(id))
        });
        server.register_mutation("messages.fail", |_, _| Err(ServerFailure::new("rejected")));
        server.register_action("echo", |args| Ok(args.clone()));
        server
    }

    /// Registers a query function.
    pub fn register_query<F>(&mut self, path: &str, query: F)
    where
        F: Fn(&Tables, &Value) -> Result<Value, String> + Send + 'static,
    {
        self.queries.insert(path.to_string(), Box::new(query));
    }

    /// Registers a mutation function.
    pub fn register_mutation<F>(&mut self, path: &str, mutation: F)
    where
        F: Fn(&mut Tables, &Value) -> Outcome + Send + 'static,
    {
        self.mutations.insert(path.to_string(), Box::new(mutation));
    }

    /// Registers an action function.
    pub fn register_action<F>(&mut self, path: &str, action: F)
    where
        F: Fn(&Value) -> Outcome + Send + 'static,
    {
        self.actions.insert(path.to_string(), Box::new(action));
    }

    /// Chooses how result changes are encoded.
    pub fn set_encoding(&mut self, encoding: ResultEncoding) {
        self.encoding = encoding;
    }

    /// Chooses whether mutation responses precede their transitions.
    pub fn set_response_order(&mut self, order: ResponseOrder) {
        self.order = order;
    }

    /// Makes `token` fail authentication.
    pub fn reject_token(&mut self, token: impl Into<String>) {
        self.rejected_tokens.insert(token.into());
    }

    /// Starts a fresh session, dropping all per-connection state. Call
    /// whenever the client's transport opens.
    pub fn new_session(&mut self) {
        self.session = Session::default();
        self.sessions += 1;
    }

    /// Number of sessions started with [`FakeServer::new_session`].
    pub fn session_count(&self) -> u32 {
        self.sessions
    }

    /// Current log position of this session.
    pub fn position(&self) -> LogPosition {
        self.session.position
    }

    /// Token presented in this session.
    pub fn token(&self) -> Option<&str> {
        self.session.token.as_deref()
    }

    /// Active subscriptions as `(query_id, function_path, args)`.
    pub fn subscriptions(&self) -> Vec<(QueryId, String, Value)> {
        self.session
            .queries
            .iter()
            .map(|(id, q)| (*id, q.function_path.clone(), q.args.clone()))
            .collect()
    }

    /// Every client message received so far, across sessions.
    pub fn received(&self) -> &[ClientMessage] {
        &self.received
    }

    /// Drains the received message log.
    pub fn take_received(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.received)
    }

    /// Direct access to the table store.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Inserts a document outside any mutation.
    ///
    /// Subscribers see it after [`FakeServer::publish`].
    pub fn insert(&mut self, table: &str, document: Value) {
        self.tables.entry(table.to_string()).or_default().push(document);
    }

    /// Re-evaluates every subscribed query and emits a transition if any
    /// result changed.
    pub fn publish(&mut self) -> ProtocolResult<Option<Bytes>> {
        let modifications = self.refresh_all();
        if modifications.is_empty() {
            return Ok(None);
        }
        self.transition(modifications).map(Some)
    }

    /// Handles one client frame and returns the server's replies.
    pub fn receive(&mut self, frame: &[u8]) -> ProtocolResult<Vec<Bytes>> {
        let message = ClientMessage::decode(frame)?;
        self.received.push(message.clone());

        match message {
            ClientMessage::Authenticate { token } => {
                if let Some(rejected) = token.as_ref().filter(|t| self.rejected_tokens.contains(*t))
                {
                    let reply = ServerMessage::AuthError {
                        reason: format!("token {rejected} rejected"),
                    };
                    return Ok(vec![encode(&reply)?]);
                }
                self.session.token = token;
                Ok(Vec::new())
            }
            ClientMessage::ModifySubscriptions { add, remove } => {
                let mut modifications = Vec::new();
                for query_id in remove {
                    if self.session.queries.remove(&query_id).is_some() {
                        modifications.push(StateModification::Removed { query_id });
                    }
                }
                for sub in add {
                    self.session.queries.insert(
                        sub.query_id,
                        ServerQuery {
                            function_path: sub.function_path,
                            args: sub.args,
                            last: None,
                        },
                    );
                    if let Some(modification) = self.refresh(sub.query_id) {
                        modifications.push(modification);
                    }
                }
                if modifications.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![self.transition(modifications)?])
            }
            ClientMessage::Mutation {
                request_id,
                function_path,
                args,
            } => {
                let outcome = match self.mutations.get(&function_path) {
                    Some(mutation) => mutation(&mut self.tables, &args),
                    None => Err(ServerFailure::new(format!(
                        "unknown mutation {function_path}"
                    ))),
                };
                if outcome.is_err() {
                    let reply = ServerMessage::MutationResponse {
                        request_id,
                        outcome,
                        position: None,
                    };
                    return Ok(vec![encode(&reply)?]);
                }

                let modifications = self.refresh_all();
                let transition = self.transition(modifications)?;
                let response = encode(&ServerMessage::MutationResponse {
                    request_id,
                    outcome,
                    position: Some(self.session.position),
                })?;
                Ok(match self.order {
                    ResponseOrder::ResponseFirst => vec![response, transition],
                    ResponseOrder::TransitionFirst => vec![transition, response],
                })
            }
            ClientMessage::Action {
                request_id,
                function_path,
                args,
            } => {
                let outcome = match self.actions.get(&function_path) {
                    Some(action) => action(&args),
                    None => Err(ServerFailure::new(format!("unknown action {function_path}"))),
                };
                let reply = ServerMessage::ActionResponse {
                    request_id,
                    outcome,
                };
                Ok(vec![encode(&reply)?])
            }
            ClientMessage::Ping => Ok(vec![encode(&ServerMessage::Pong)?]),
        }
    }

    fn transition(&mut self, modifications: Vec<StateModification>) -> ProtocolResult<Bytes> {
        self.session.position = self.session.position.successor();
        encode(&ServerMessage::Transition {
            position: self.session.position,
            modifications,
        })
    }

    fn refresh_all(&mut self) -> Vec<StateModification> {
        let ids: Vec<QueryId> = self.session.queries.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.refresh(id)).collect()
    }

    /// Evaluates one query and returns the modification bringing the
    /// client up to date, if the result changed.
    fn refresh(&mut self, query_id: QueryId) -> Option<StateModification> {
        let query = self.session.queries.get_mut(&query_id)?;
        let current = match self.queries.get(&query.function_path) {
            Some(function) => function(&self.tables, &query.args),
            None => Err(format!("unknown query {}", query.function_path)),
        };
        if query.last.as_ref() == Some(&current) {
            return None;
        }
        let previous = query.last.replace(current.clone());

        Some(match current {
            Err(message) => StateModification::Failed { query_id, message },
            Ok(value) => {
                let patch = match (self.encoding, previous) {
                    (ResultEncoding::Patch, Some(Ok(old))) => diff_documents(&old, &value),
                    _ => None,
                };
                match patch {
                    Some(changes) => StateModification::Patched { query_id, changes },
                    None => StateModification::Updated { query_id, value },
                }
            }
        })
    }
}

impl std::fmt::Debug for FakeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeServer")
            .field("position", &self.session.position)
            .field("subscriptions", &self.session.queries.len())
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

fn encode(message: &ServerMessage) -> ProtocolResult<Bytes> {
    message.encode().map(Bytes::from)
}

fn document_id(doc: &Value) -> Option<&str> {
    doc.get(DOCUMENT_ID_FIELD).and_then(Value::as_str)
}

/// Diffs two arrays of documents keyed by `_id`.
///
/// Returns `None` when either side is not such an array, or when
/// applying upserts in place would not reproduce the new ordering.
fn diff_documents(old: &Value, new: &Value) -> Option<Vec<DocumentChange>> {
    let old = old.as_array()?;
    let new = new.as_array()?;
    let old_by_id: HashMap<&str, &Value> = old
        .iter()
        .map(|doc| document_id(doc).map(|id| (id, doc)))
        .collect::<Option<_>>()?;
    let new_ids: HashSet<&str> = new.iter().map(document_id).collect::<Option<_>>()?;

    let surviving: Vec<&str> = old
        .iter()
        .filter_map(document_id)
        .filter(|id| new_ids.contains(id))
        .collect();
    let new_order: Vec<&str> = new.iter().filter_map(document_id).collect();
    if new_order[..surviving.len().min(new_order.len())] != surviving[..] {
        return None;
    }

    let mut changes: Vec<DocumentChange> = old
        .iter()
        .filter_map(document_id)
        .filter(|id| !new_ids.contains(id))
        .map(|id| DocumentChange::Remove { id: id.to_string() })
        .collect();
    for doc in new {
        let id = document_id(doc)?;
        if old_by_id.get(id) != Some(&doc) {
            changes.push(DocumentChange::Upsert {
                id: id.to_string(),
                document: doc.clone(),
            });
        }
    }
    Some(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{channel_args, message_doc};
    use livequery_protocol::{QuerySubscription, RequestId};

    fn subscribe(server: &mut FakeServer, id: u32, channel: &str) -> Vec<ServerMessage> {
        let msg = ClientMessage::ModifySubscriptions {
            add: vec![QuerySubscription::new(
                QueryId::new(id),
                "messages.list",
                channel_args(channel),
            )],
            remove: vec![],
        };
        decode_all(server.receive(&msg.encode().unwrap()).unwrap())
    }

    fn decode_all(frames: Vec<Bytes>) -> Vec<ServerMessage> {
        frames
            .iter()
            .map(|f| ServerMessage::decode(f).unwrap())
            .collect()
    }

    #[test]
    fn subscribe_sends_initial_result() {
        let mut server = FakeServer::with_messages();
        server.insert("messages", message_doc("m1", "general", "hi"));

        let replies = subscribe(&mut server, 0, "general");
        assert_eq!(
            replies,
            vec![ServerMessage::Transition {
                position: LogPosition::new(1),
                modifications: vec![StateModification::Updated {
                    query_id: QueryId::new(0),
                    value: Value::Array(vec![message_doc("m1", "general", "hi")]),
                }],
            }]
        );
        assert_eq!(server.subscriptions().len(), 1);
    }

    #[test]
    fn mutation_response_precedes_transition() {
        let mut server = FakeServer::with_messages();
        subscribe(&mut server, 0, "general");

        let send = ClientMessage::Mutation {
            request_id: RequestId::new(0),
            function_path: "messages.send".into(),
            args: Value::object([("channel", "general".into()), ("body", "yo".into())]),
        };
        let replies = decode_all(server.receive(&send.encode().unwrap()).unwrap());
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[0],
            ServerMessage::MutationResponse {
                request_id: RequestId::new(0),
                outcome: Ok(Value::from("m1")),
                position: Some(LogPosition::new(2)),
            }
        );
        assert!(matches!(
            &replies[1],
            ServerMessage::Transition { position, .. } if *position == LogPosition::new(2)
        ));
    }

    #[test]
    fn failed_mutation_has_no_position() {
        let mut server = FakeServer::with_messages();
        let fail = ClientMessage::Mutation {
            request_id: RequestId::new(4),
            function_path: "messages.fail".into(),
            args: Value::empty_object(),
        };
        let replies = decode_all(server.receive(&fail.encode().unwrap()).unwrap());
        assert_eq!(
            replies,
            vec![ServerMessage::MutationResponse {
                request_id: RequestId::new(4),
                outcome: Err(ServerFailure::new("rejected")),
                position: None,
            }]
        );
        assert_eq!(server.position(), LogPosition::INITIAL);
    }

    #[test]
    fn patch_encoding_emits_document_changes() {
        let mut server = FakeServer::with_messages();
        server.set_encoding(ResultEncoding::Patch);
        server.insert("messages", message_doc("m1", "general", "hi"));
        subscribe(&mut server, 0, "general");

        server.insert("messages", message_doc("m2", "general", "there"));
        let frame = server.publish().unwrap().unwrap();
        assert_eq!(
            ServerMessage::decode(&frame).unwrap(),
            ServerMessage::Transition {
                position: LogPosition::new(2),
                modifications: vec![StateModification::Patched {
                    query_id: QueryId::new(0),
                    changes: vec![DocumentChange::Upsert {
                        id: "m2".into(),
                        document: message_doc("m2", "general", "there"),
                    }],
                }],
            }
        );
        assert!(server.publish().unwrap().is_none());
    }

    #[test]
    fn rejected_token_gets_auth_error() {
        let mut server = FakeServer::new();
        server.reject_token("bad");
        let auth = ClientMessage::Authenticate {
            token: Some("bad".into()),
        };
        let replies = decode_all(server.receive(&auth.encode().unwrap()).unwrap());
        assert!(matches!(replies[0], ServerMessage::AuthError { .. }));
        assert_eq!(server.token(), None);
    }

    #[test]
    fn new_session_restarts_positions() {
        let mut server = FakeServer::with_messages();
        subscribe(&mut server, 0, "general");
        assert_eq!(server.position(), LogPosition::new(1));

        server.new_session();
        assert_eq!(server.position(), LogPosition::INITIAL);
        assert!(server.subscriptions().is_empty());
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn diff_falls_back_on_reorder() {
        let a = message_doc("a", "c", "1");
        let b = message_doc("b", "c", "2");
        let old = Value::Array(vec![a.clone(), b.clone()]);
        let new = Value::Array(vec![b, a]);
        assert!(diff_documents(&old, &new).is_none());
    }
}
