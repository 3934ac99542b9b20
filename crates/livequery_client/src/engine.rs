//! The sync engine facade.
//!
//! [`SyncEngine`] is sans-IO and single-owner: every state change happens
//! inside a `&mut self` call, either a transport event, a timer check via
//! [`SyncEngine::tick`], or a caller operation. Listeners run synchronously
//! at the end of the call that changed their query, after the whole event
//! (including optimistic re-application) has been applied.

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, Delivery, StateObserver, TimerEvent};
use crate::error::{ClientError, ClientResult};
use crate::mutations::{MutationQueue, PendingResult, RequestKind, RequestState, ResponseEffect};
use crate::registry::{Listener, Subscribed, SubscriptionHandle, SubscriptionRegistry, Unsubscribed};
use crate::store::{LocalStore, OptimisticUpdate, QuerySnapshot};
use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use livequery_codec::{to_canonical_cbor, Value};
use livequery_protocol::{
    validate_function_path, ClientMessage, LogPosition, ProtocolError, QueryIdentity, RequestId,
    ServerMessage, StateModification,
};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Callback invoked with the server's reason when a token is rejected.
pub type AuthErrorHandler = Box<dyn FnMut(&str) + Send>;

/// Statistics about the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStats {
    /// Current connection state.
    pub connection_state: ConnectionState,
    /// Log position of the current session.
    pub position: LogPosition,
    /// Distinct live subscriptions.
    pub active_subscriptions: usize,
    /// Mutations and actions not yet resolved.
    pub pending_requests: usize,
    /// Requests still waiting to be transmitted.
    pub queued_requests: usize,
    /// Optimistic overlays currently applied.
    pub optimistic_overlays: usize,
    /// Outgoing messages waiting for a connection.
    pub buffered_messages: usize,
    /// Frames written to the transport.
    pub frames_sent: u64,
    /// Frames received from the server.
    pub frames_received: u64,
    /// Transitions applied to the store.
    pub transitions_applied: u64,
    /// Reconnect attempts scheduled.
    pub reconnects: u64,
    /// Resyncs forced by protocol errors.
    pub resyncs: u64,
    /// Requests resolved successfully.
    pub requests_resolved: u64,
    /// Requests rejected.
    pub requests_rejected: u64,
    /// Listener invocations.
    pub notifications: u64,
    /// Last connection, protocol or auth problem.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: u64,
    transitions_applied: u64,
    resyncs: u64,
    notifications: u64,
    last_error: Option<String>,
}

/// Client-side sync engine.
pub struct SyncEngine<T: Transport, C: Clock = SystemClock> {
    clock: C,
    connection: ConnectionManager<T>,
    registry: SubscriptionRegistry,
    store: LocalStore,
    mutations: MutationQueue,
    on_auth_error: Option<AuthErrorHandler>,
    counters: Counters,
}

impl<T: Transport> SyncEngine<T, SystemClock> {
    /// Creates an engine using the wall clock.
    pub fn new(config: &ClientConfig, transport: T) -> Self {
        Self::with_clock(config, transport, SystemClock)
    }
}

impl<T: Transport, C: Clock> SyncEngine<T, C> {
    /// Creates an engine with an explicit clock.
    pub fn with_clock(config: &ClientConfig, transport: T, clock: C) -> Self {
        Self {
            clock,
            connection: ConnectionManager::new(
                transport,
                config.backoff.clone(),
                config.heartbeat.clone(),
                config.auth_token.clone(),
            ),
            registry: SubscriptionRegistry::new(),
            store: LocalStore::new(),
            mutations: MutationQueue::new(),
            on_auth_error: None,
            counters: Counters::default(),
        }
    }

    /// Starts connecting. Does nothing unless Disconnected and not closed.
    pub fn connect(&mut self) {
        let now = self.clock.now();
        self.connection.connect(now);
    }

    /// Feeds a transport event to the engine.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Frame(frame) => self.on_frame(&frame),
            TransportEvent::Closed { reason } => {
                if self.connection.is_closed()
                    || self.connection.awaiting_retry()
                    || self.connection.state() == ConnectionState::Disconnected
                {
                    debug!(%reason, "close event ignored");
                } else {
                    self.transport_failed(&reason);
                }
            }
        }
        self.settle();
    }

    /// Checks timers (reconnect backoff, heartbeat) against the clock.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        match self.connection.poll_timers(now) {
            Some(TimerEvent::RetryDue) => {
                debug!(attempt = self.connection.attempt(), "reconnect attempt");
                self.connection.begin_attempt(now);
            }
            Some(TimerEvent::PingDue) => match self.connection.send(ClientMessage::Ping) {
                Ok(_) => self.connection.on_ping_sent(now),
                Err(err) => self.transport_failed(&err.to_string()),
            },
            Some(TimerEvent::PongOverdue) => {
                self.transport_failed("no traffic after ping");
            }
            None => {}
        }
        self.settle();
    }

    /// Earliest instant at which [`Self::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.connection.next_deadline()
    }

    /// Subscribes a listener to the result of `function_path(args)`.
    ///
    /// Subscriptions with structurally equal arguments share one server
    /// query. A listener joining an existing subscription immediately
    /// receives the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad path or unencodable arguments
    /// and `EngineClosed` after [`Self::close`].
    pub fn subscribe(
        &mut self,
        function_path: &str,
        args: Value,
        listener: Listener,
    ) -> ClientResult<SubscriptionHandle> {
        self.ensure_open()?;
        let identity = QueryIdentity::new(function_path, &args)?;
        let (handle, outcome) = self.registry.subscribe(identity.clone(), args.clone(), listener);
        match outcome {
            Subscribed::Existing => {
                if let Some(snapshot) = self.store.get(&identity) {
                    self.registry.notify_one(handle, &snapshot);
                    self.counters.notifications += 1;
                }
            }
            Subscribed::New(subscription) => {
                self.store.insert(handle.query_id(), identity, args);
                self.send(ClientMessage::ModifySubscriptions {
                    add: vec![subscription],
                    remove: vec![],
                });
            }
        }
        self.settle();
        Ok(handle)
    }

    /// Removes a listener. The last listener of a query tears the
    /// subscription down. Returns false for unknown or stale handles.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        match self.registry.unsubscribe(handle) {
            Unsubscribed::Unknown => false,
            Unsubscribed::ListenerRemoved => true,
            Unsubscribed::RecordRemoved(query_id) => {
                self.store.remove(query_id);
                if !self.connection.is_closed() {
                    self.send(ClientMessage::ModifySubscriptions {
                        add: vec![],
                        remove: vec![query_id],
                    });
                }
                self.settle();
                true
            }
        }
    }

    /// Issues a mutation, optionally applying `optimistic_update` to the
    /// local results until the server confirms or rejects it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad path or unencodable arguments
    /// and `EngineClosed` after [`Self::close`].
    pub fn mutate(
        &mut self,
        function_path: &str,
        args: Value,
        optimistic_update: Option<OptimisticUpdate>,
    ) -> ClientResult<PendingResult> {
        self.ensure_open()?;
        validate_call(function_path, &args)?;
        let (request_id, pending) = self.mutations.enqueue(RequestKind::Mutation, function_path);
        let optimistic = optimistic_update.is_some();
        if let Some(update) = optimistic_update {
            self.store.push_overlay(request_id, update);
        }
        self.send(ClientMessage::Mutation {
            request_id,
            function_path: function_path.to_string(),
            args,
        });
        self.settle();
        if optimistic {
            if let Some(touched) = self.store.touched_by(request_id) {
                debug!(request_id = %request_id, touched = touched.len(), "optimistic update applied");
            }
        }
        Ok(pending)
    }

    /// Issues an action. Actions have no optimistic update and resolve on
    /// their response alone.
    ///
    /// # Errors
    ///
    /// Same as [`Self::mutate`].
    pub fn action(&mut self, function_path: &str, args: Value) -> ClientResult<PendingResult> {
        self.ensure_open()?;
        validate_call(function_path, &args)?;
        let (request_id, pending) = self.mutations.enqueue(RequestKind::Action, function_path);
        self.send(ClientMessage::Action {
            request_id,
            function_path: function_path.to_string(),
            args,
        });
        self.settle();
        Ok(pending)
    }

    /// Registers an observer called synchronously on every connection
    /// state transition.
    pub fn on_connection_state_change(&mut self, observer: StateObserver) {
        self.connection.add_observer(observer);
    }

    /// Stores a token and presents it to the server. A rejected token
    /// leaves outgoing actions buffered until a new token is set.
    pub fn set_auth_token(&mut self, token: impl Into<String>, on_error: Option<AuthErrorHandler>) {
        if on_error.is_some() {
            self.on_auth_error = on_error;
        }
        self.apply_token(Some(token.into()));
    }

    /// Forgets the stored token and continues unauthenticated.
    pub fn clear_auth(&mut self) {
        self.on_auth_error = None;
        self.apply_token(None);
    }

    /// Current snapshot of a subscribed query, overlays included.
    pub fn get_result(&self, function_path: &str, args: &Value) -> Option<QuerySnapshot> {
        let identity = QueryIdentity::new(function_path, args).ok()?;
        let query_id = self.registry.query_id(&identity)?;
        self.store.snapshot(query_id)
    }

    /// Returns true if an auth token is stored.
    pub fn has_auth_token(&self) -> bool {
        self.connection.token().is_some()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Log position of the current session.
    pub fn position(&self) -> LogPosition {
        self.store.position()
    }

    /// Lifecycle state of an unresolved request.
    pub fn request_state(&self, request_id: RequestId) -> Option<RequestState> {
        self.mutations.state(request_id)
    }

    /// Returns true once [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connection_state: self.connection.state(),
            position: self.store.position(),
            active_subscriptions: self.registry.len(),
            pending_requests: self.mutations.len(),
            queued_requests: self.mutations.count(RequestState::Queued),
            optimistic_overlays: self.store.overlay_count(),
            buffered_messages: self.connection.buffered(),
            frames_sent: self.connection.frames_sent(),
            frames_received: self.counters.frames_received,
            transitions_applied: self.counters.transitions_applied,
            reconnects: self.connection.reconnects(),
            resyncs: self.counters.resyncs,
            requests_resolved: self.mutations.resolved_count(),
            requests_rejected: self.mutations.rejected_count(),
            notifications: self.counters.notifications,
            last_error: self.counters.last_error.clone(),
        }
    }

    /// Shuts the engine down for good. Pending requests are rejected with
    /// `EngineClosed`; cached results stay readable.
    pub fn close(&mut self) {
        if self.connection.is_closed() {
            return;
        }
        info!("closing sync engine");
        self.connection.close();
        for request_id in self.mutations.reject_all(&ClientError::EngineClosed) {
            self.store.remove_overlay(request_id);
        }
        self.settle();
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.connection.is_closed() {
            Err(ClientError::EngineClosed)
        } else {
            Ok(())
        }
    }

    fn apply_token(&mut self, token: Option<String>) {
        if self.connection.is_closed() {
            return;
        }
        match self.connection.set_token(token) {
            Ok(true) => self.flush(),
            Ok(false) => {}
            Err(err) => self.transport_failed(&err.to_string()),
        }
        self.settle();
    }

    fn send(&mut self, message: ClientMessage) {
        let request_id = message.request_id();
        match self.connection.send(message) {
            Ok(Delivery::Transmitted) => {
                if let Some(id) = request_id {
                    self.mutations.mark_in_flight(&[id]);
                }
            }
            Ok(Delivery::Buffered) => {}
            Err(err) => {
                // The frame may have reached the server.
                if let Some(id) = request_id {
                    self.mutations.mark_in_flight(&[id]);
                }
                self.transport_failed(&err.to_string());
            }
        }
    }

    fn flush(&mut self) {
        let mut sent = Vec::new();
        let result = self.connection.flush(&mut sent);
        self.mutations.mark_in_flight(&sent);
        if let Err(err) = result {
            self.transport_failed(&err.to_string());
        }
    }

    fn on_opened(&mut self) {
        let now = self.clock.now();
        match self.connection.on_opened(now) {
            Ok(true) => {}
            Ok(false) => {
                debug!("open event ignored");
                return;
            }
            Err(err) => {
                self.transport_failed(&err.to_string());
                return;
            }
        }
        self.store.reset_position();
        self.connection.discard_buffered_subscription_changes();
        let add = self.registry.all_subscriptions();
        if !add.is_empty() {
            info!(count = add.len(), "replaying subscriptions");
            let replay = ClientMessage::ModifySubscriptions {
                add,
                remove: vec![],
            };
            if !self.connection.state().is_connected() {
                // Sent ahead of the buffer once a new token arrives.
                self.connection.buffer_first(replay);
                return;
            }
            if let Err(err) = self.connection.transmit(&replay) {
                self.transport_failed(&err.to_string());
                return;
            }
        }
        self.flush();
    }

    fn on_frame(&mut self, frame: &Bytes) {
        if !self.connection.is_transport_open() {
            debug!(len = frame.len(), "frame while not connected ignored");
            return;
        }
        let now = self.clock.now();
        self.connection.on_traffic(now);
        self.counters.frames_received += 1;

        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                self.resync(&format!("undecodable frame: {err}"));
                return;
            }
        };
        match message {
            ServerMessage::Transition {
                position,
                modifications,
            } => self.on_transition(position, modifications),
            ServerMessage::MutationResponse {
                request_id,
                outcome,
                position,
            } => {
                let current = self.store.position();
                let effect =
                    self.mutations
                        .on_mutation_response(request_id, outcome, position, current);
                if effect == ResponseEffect::Resolved {
                    self.store.remove_overlay(request_id);
                }
            }
            ServerMessage::ActionResponse {
                request_id,
                outcome,
            } => {
                self.mutations.on_action_response(request_id, outcome);
            }
            ServerMessage::AuthError { reason } => {
                warn!(%reason, "authentication rejected");
                self.counters.last_error = Some(format!("authentication failed: {reason}"));
                self.connection.on_auth_error();
                if let Some(handler) = self.on_auth_error.as_mut() {
                    handler(&reason);
                }
            }
            ServerMessage::Pong => debug!("pong"),
        }
    }

    fn on_transition(&mut self, position: LogPosition, modifications: Vec<StateModification>) {
        match self.store.apply_transition(position, modifications) {
            Ok(applied) => {
                self.connection.on_progress();
                self.counters.transitions_applied += 1;
                debug!(position = %position, applied, "transition applied");
                for request_id in self.mutations.resolve_reached(position) {
                    self.store.remove_overlay(request_id);
                }
            }
            Err(err) => self.resync(&err.to_string()),
        }
    }

    /// Drops cached results and starts a fresh session.
    fn resync(&mut self, reason: &str) {
        warn!(%reason, "protocol error, resyncing");
        self.counters.resyncs += 1;
        self.counters.last_error = Some(format!("protocol error: {reason}"));
        self.store.reset_to_loading();
        self.drop_unconfirmed();
        let now = self.clock.now();
        self.connection.restart(now);
    }

    fn transport_failed(&mut self, reason: &str) {
        if self.connection.is_closed() {
            return;
        }
        info!(%reason, "connection lost");
        self.counters.last_error = Some(format!("connection lost: {reason}"));
        self.store.mark_stale();
        self.drop_unconfirmed();
        let now = self.clock.now();
        self.connection.on_transport_lost(now);
    }

    fn drop_unconfirmed(&mut self) {
        for request_id in self.mutations.on_connection_lost() {
            self.store.remove_overlay(request_id);
        }
    }

    /// Re-applies overlays and notifies listeners of changed queries.
    fn settle(&mut self) {
        self.store.recompute();
        for query_id in self.store.take_dirty() {
            if let Some(snapshot) = self.store.snapshot(query_id) {
                let calls = self.registry.notify(query_id, &snapshot);
                self.counters.notifications += calls as u64;
            }
        }
    }
}

fn validate_call(function_path: &str, args: &Value) -> ClientResult<()> {
    validate_function_path(function_path)?;
    to_canonical_cbor(args).map_err(ProtocolError::from)?;
    Ok(())
}
