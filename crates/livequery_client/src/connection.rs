//! Connection state machine.
//!
//! Owns the transport, the reconnect backoff, heartbeat deadlines, the
//! stored auth token and the outgoing buffer. Everything here is driven by
//! explicit calls carrying the current instant; nothing sleeps.

use crate::config::{BackoffConfig, HeartbeatConfig};
use crate::error::ClientResult;
use crate::transport::Transport;
use bytes::Bytes;
use livequery_protocol::{ClientMessage, RequestId};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info};

/// The current state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Transport open, authentication pending or rejected. Outgoing
    /// actions are buffered.
    Authenticating,
    /// Messages flow freely.
    Connected,
    /// Waiting out the backoff after a failure.
    Reconnecting,
}

impl ConnectionState {
    /// Returns true if outgoing messages are transmitted immediately.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true if the machine is working towards a connection.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

/// Callback invoked on every state transition.
pub type StateObserver = Box<dyn FnMut(ConnectionState) + Send>;

/// Timer expiry reported by [`ConnectionManager::poll_timers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// The backoff delay elapsed; open the transport again.
    RetryDue,
    /// No server traffic for the idle timeout; send a ping.
    PingDue,
    /// Nothing arrived within the pong timeout after a ping.
    PongOverdue,
}

/// Whether a message went out or waits in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Transmitted,
    Buffered,
}

pub(crate) struct ConnectionManager<T: Transport> {
    transport: T,
    backoff: BackoffConfig,
    heartbeat: HeartbeatConfig,
    state: ConnectionState,
    transport_open: bool,
    closed: bool,
    attempt: u32,
    retry_at: Option<Instant>,
    last_traffic: Option<Instant>,
    ping_sent_at: Option<Instant>,
    token: Option<String>,
    token_rejected: bool,
    restarts: u32,
    buffer: VecDeque<ClientMessage>,
    observers: Vec<StateObserver>,
    frames_sent: u64,
    reconnects: u64,
}

impl<T: Transport> ConnectionManager<T> {
    pub(crate) fn new(
        transport: T,
        backoff: BackoffConfig,
        heartbeat: HeartbeatConfig,
        token: Option<String>,
    ) -> Self {
        Self {
            transport,
            backoff,
            heartbeat,
            state: ConnectionState::Disconnected,
            transport_open: false,
            closed: false,
            attempt: 0,
            retry_at: None,
            last_traffic: None,
            ping_sent_at: None,
            token,
            token_rejected: false,
            restarts: 0,
            buffer: VecDeque::new(),
            observers: Vec::new(),
            frames_sent: 0,
            reconnects: 0,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_transport_open(&self) -> bool {
        self.transport_open
    }

    pub(crate) fn awaiting_retry(&self) -> bool {
        self.retry_at.is_some()
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub(crate) fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub(crate) fn add_observer(&mut self, observer: StateObserver) {
        self.observers.push(observer);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "connection state change");
        self.state = state;
        for observer in &mut self.observers {
            observer(state);
        }
    }

    /// Starts the machine from Disconnected.
    pub(crate) fn connect(&mut self, now: Instant) {
        if self.closed || self.state != ConnectionState::Disconnected {
            return;
        }
        self.set_state(ConnectionState::Connecting);
        self.begin_attempt(now);
    }

    /// Opens the transport. A synchronous failure schedules the next
    /// attempt.
    pub(crate) fn begin_attempt(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting);
        if let Err(err) = self.transport.open() {
            info!(error = %err, attempt = self.attempt, "transport open failed");
            self.schedule_reconnect(now);
        }
    }

    /// Transport finished opening. Sends `Authenticate` when a token is
    /// stored and enters Connected. A token the server already rejected is
    /// not presented again; the machine stays Authenticating until
    /// [`Self::set_token`]. Returns false if the event was not expected in
    /// the current state.
    pub(crate) fn on_opened(&mut self, now: Instant) -> ClientResult<bool> {
        if self.closed || self.state != ConnectionState::Connecting {
            return Ok(false);
        }
        self.transport_open = true;
        self.retry_at = None;
        self.last_traffic = Some(now);
        self.ping_sent_at = None;
        self.set_state(ConnectionState::Authenticating);
        if self.token_rejected {
            debug!("stored token was rejected, waiting for a new one");
            return Ok(true);
        }
        if let Some(token) = self.token.clone() {
            self.transmit(&ClientMessage::Authenticate { token: Some(token) })?;
        }
        if self.attempt > 0 {
            info!(attempts = self.attempt, "reconnected");
        }
        self.attempt = 0;
        self.set_state(ConnectionState::Connected);
        Ok(true)
    }

    /// Records incoming traffic for the heartbeat.
    pub(crate) fn on_traffic(&mut self, now: Instant) {
        self.last_traffic = Some(now);
        self.ping_sent_at = None;
    }

    /// Closes the transport and schedules a reconnect with backoff.
    pub(crate) fn on_transport_lost(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.shut_transport();
        self.schedule_reconnect(now);
    }

    /// Closes the transport and opens a new one. The first restart since
    /// the last [`Self::on_progress`] reopens right away; later ones back
    /// off.
    pub(crate) fn restart(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.shut_transport();
        self.restarts = self.restarts.saturating_add(1);
        if self.restarts > 1 {
            self.attempt = self.restarts - 2;
            self.schedule_reconnect(now);
            return;
        }
        self.reconnects += 1;
        self.set_state(ConnectionState::Reconnecting);
        self.begin_attempt(now);
    }

    /// The session made progress; the next restart reopens immediately.
    pub(crate) fn on_progress(&mut self) {
        self.restarts = 0;
    }

    fn shut_transport(&mut self) {
        self.transport.close();
        self.transport_open = false;
        self.last_traffic = None;
        self.ping_sent_at = None;
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        self.attempt = self.attempt.saturating_add(1);
        self.reconnects += 1;
        let delay = self.backoff.delay_for_attempt(self.attempt);
        info!(
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        self.retry_at = Some(now + delay);
        self.set_state(ConnectionState::Reconnecting);
    }

    /// Sends or buffers a message. Ping bypasses the buffer.
    pub(crate) fn send(&mut self, message: ClientMessage) -> ClientResult<Delivery> {
        if self.state.is_connected() || (matches!(message, ClientMessage::Ping) && self.transport_open) {
            self.transmit(&message)?;
            Ok(Delivery::Transmitted)
        } else {
            self.buffer.push_back(message);
            Ok(Delivery::Buffered)
        }
    }

    /// Encodes and writes one message to the transport, bypassing the
    /// buffer.
    pub(crate) fn transmit(&mut self, message: &ClientMessage) -> ClientResult<()> {
        let frame = Bytes::from(message.encode()?);
        self.transport.send(frame)?;
        self.frames_sent += 1;
        Ok(())
    }

    /// Drops buffered subscription changes; the full replay supersedes
    /// them.
    pub(crate) fn discard_buffered_subscription_changes(&mut self) {
        self.buffer
            .retain(|m| !matches!(m, ClientMessage::ModifySubscriptions { .. }));
    }

    /// Puts a message ahead of everything buffered.
    pub(crate) fn buffer_first(&mut self, message: ClientMessage) {
        self.buffer.push_front(message);
    }

    /// Transmits the buffer in order while Connected.
    ///
    /// Request ids of transmitted mutations and actions are pushed to
    /// `sent`. On a send failure the failed request also counts as sent and
    /// the rest stays buffered.
    pub(crate) fn flush(&mut self, sent: &mut Vec<RequestId>) -> ClientResult<()> {
        while self.state.is_connected() {
            let Some(message) = self.buffer.pop_front() else {
                break;
            };
            if let Some(id) = message.request_id() {
                sent.push(id);
            }
            self.transmit(&message)?;
        }
        Ok(())
    }

    /// Stores a new token. When the transport is open the token is sent
    /// right away and an Authenticating machine returns to Connected.
    /// Returns true if the state went back to Connected.
    pub(crate) fn set_token(&mut self, token: Option<String>) -> ClientResult<bool> {
        self.token = token;
        self.token_rejected = false;
        if !self.transport_open || self.closed {
            return Ok(false);
        }
        self.transmit(&ClientMessage::Authenticate {
            token: self.token.clone(),
        })?;
        if self.state == ConnectionState::Authenticating {
            self.set_state(ConnectionState::Connected);
            return Ok(true);
        }
        Ok(false)
    }

    /// The server rejected the token. It stays rejected across reconnects
    /// until replaced.
    pub(crate) fn on_auth_error(&mut self) {
        self.token_rejected = true;
        if self.state == ConnectionState::Connected {
            self.set_state(ConnectionState::Authenticating);
        }
    }

    /// Reports the first expired timer, if any.
    pub(crate) fn poll_timers(&self, now: Instant) -> Option<TimerEvent> {
        if self.closed {
            return None;
        }
        if let Some(at) = self.retry_at {
            return (now >= at).then_some(TimerEvent::RetryDue);
        }
        if !self.transport_open || !self.heartbeat.enabled {
            return None;
        }
        if let Some(sent) = self.ping_sent_at {
            return (now >= sent + self.heartbeat.pong_timeout).then_some(TimerEvent::PongOverdue);
        }
        let last = self.last_traffic?;
        (now >= last + self.heartbeat.idle_timeout).then_some(TimerEvent::PingDue)
    }

    /// Records that a ping went out.
    pub(crate) fn on_ping_sent(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
    }

    /// Earliest instant at which [`Self::poll_timers`] may report something.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        if self.retry_at.is_some() {
            return self.retry_at;
        }
        if !self.transport_open || !self.heartbeat.enabled {
            return None;
        }
        match self.ping_sent_at {
            Some(sent) => Some(sent + self.heartbeat.pong_timeout),
            None => self.last_traffic.map(|last| last + self.heartbeat.idle_timeout),
        }
    }

    /// Permanently shuts the machine down.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.shut_transport();
        self.closed = true;
        self.retry_at = None;
        self.buffer.clear();
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager(mock: &MockTransport) -> ConnectionManager<MockTransport> {
        ConnectionManager::new(
            mock.clone(),
            BackoffConfig::new(Duration::from_millis(100)).with_jitter(0.0),
            HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(5)),
            None,
        )
    }

    #[test]
    fn state_checks() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Authenticating.is_connected());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
    }

    #[test]
    fn connect_then_open_reaches_connected() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.add_observer(Box::new(move |state| sink.lock().push(state)));

        let now = Instant::now();
        conn.connect(now);
        assert_eq!(mock.open_calls(), 1);
        assert!(conn.on_opened(now).unwrap());

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Authenticating,
                ConnectionState::Connected
            ]
        );
        // No token, nothing sent.
        assert!(mock.take_frames().is_empty());
    }

    #[test]
    fn buffers_until_connected_and_ping_bypasses() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        let now = Instant::now();
        conn.connect(now);

        let delivery = conn
            .send(ClientMessage::Mutation {
                request_id: RequestId::new(1),
                function_path: "f".into(),
                args: livequery_codec::Value::Null,
            })
            .unwrap();
        assert_eq!(delivery, Delivery::Buffered);
        assert_eq!(conn.buffered(), 1);

        conn.on_opened(now).unwrap();
        let mut sent = Vec::new();
        conn.flush(&mut sent).unwrap();
        assert_eq!(sent, vec![RequestId::new(1)]);
        assert_eq!(conn.buffered(), 0);

        conn.on_auth_error();
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert_eq!(conn.send(ClientMessage::Ping).unwrap(), Delivery::Transmitted);
    }

    #[test]
    fn failure_schedules_backoff() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        let now = Instant::now();
        conn.connect(now);
        conn.on_opened(now).unwrap();

        conn.on_transport_lost(now);
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert_eq!(conn.attempt(), 1);
        assert_eq!(conn.next_deadline(), Some(now + Duration::from_millis(100)));
        assert_eq!(conn.poll_timers(now), None);
        assert_eq!(
            conn.poll_timers(now + Duration::from_millis(100)),
            Some(TimerEvent::RetryDue)
        );

        mock.set_fail_opens(true);
        conn.begin_attempt(now + Duration::from_millis(100));
        assert_eq!(conn.attempt(), 2);
        assert_eq!(
            conn.next_deadline(),
            Some(now + Duration::from_millis(300))
        );

        mock.set_fail_opens(false);
        conn.begin_attempt(now + Duration::from_millis(300));
        conn.on_opened(now + Duration::from_millis(300)).unwrap();
        assert_eq!(conn.attempt(), 0);
        assert!(conn.state().is_connected());
    }

    #[test]
    fn heartbeat_deadlines() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        let now = Instant::now();
        conn.connect(now);
        conn.on_opened(now).unwrap();

        assert_eq!(conn.next_deadline(), Some(now + Duration::from_secs(10)));
        let idle = now + Duration::from_secs(10);
        assert_eq!(conn.poll_timers(idle), Some(TimerEvent::PingDue));

        conn.on_ping_sent(idle);
        assert_eq!(conn.poll_timers(idle + Duration::from_secs(4)), None);
        assert_eq!(
            conn.poll_timers(idle + Duration::from_secs(5)),
            Some(TimerEvent::PongOverdue)
        );

        conn.on_traffic(idle + Duration::from_secs(1));
        assert_eq!(conn.poll_timers(idle + Duration::from_secs(5)), None);
    }

    #[test]
    fn token_sent_on_open_and_on_change() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        conn.set_token(Some("t1".into())).unwrap();
        let now = Instant::now();
        conn.connect(now);
        conn.on_opened(now).unwrap();
        assert_eq!(
            mock.take_messages(),
            vec![ClientMessage::Authenticate {
                token: Some("t1".into())
            }]
        );

        conn.on_auth_error();
        assert!(conn.set_token(Some("t2".into())).unwrap());
        assert!(conn.state().is_connected());
        assert_eq!(conn.token(), Some("t2"));
    }

    #[test]
    fn close_is_permanent() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        let now = Instant::now();
        conn.connect(now);
        conn.on_opened(now).unwrap();
        conn.close();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!mock.is_open());
        conn.on_transport_lost(now);
        conn.connect(now);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.next_deadline(), None);
    }

    #[test]
    fn retry_passes_through_connecting() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        let now = Instant::now();
        conn.connect(now);
        conn.on_opened(now).unwrap();
        conn.on_transport_lost(now);

        // Opened before the retry fired is not expected.
        assert!(!conn.on_opened(now).unwrap());
        conn.begin_attempt(now + Duration::from_millis(100));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.on_opened(now + Duration::from_millis(100)).unwrap());
        assert!(conn.state().is_connected());
    }

    #[test]
    fn rejected_token_survives_reconnect() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        conn.set_token(Some("expired".into())).unwrap();
        let now = Instant::now();
        conn.connect(now);
        conn.on_opened(now).unwrap();
        conn.on_auth_error();
        mock.take_frames();

        conn.on_transport_lost(now);
        conn.begin_attempt(now + Duration::from_millis(100));
        assert!(conn.on_opened(now + Duration::from_millis(100)).unwrap());
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert!(mock.take_frames().is_empty());

        assert!(conn.set_token(Some("fresh".into())).unwrap());
        assert!(conn.state().is_connected());
        assert_eq!(
            mock.take_messages(),
            vec![ClientMessage::Authenticate {
                token: Some("fresh".into())
            }]
        );
    }

    #[test]
    fn repeated_restarts_back_off() {
        let mock = MockTransport::new();
        let mut conn = manager(&mock);
        let now = Instant::now();
        conn.connect(now);
        conn.on_opened(now).unwrap();

        conn.restart(now);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(mock.open_calls(), 2);
        conn.on_opened(now).unwrap();

        conn.restart(now);
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert_eq!(mock.open_calls(), 2);
        assert_eq!(conn.next_deadline(), Some(now + Duration::from_millis(100)));

        conn.begin_attempt(now + Duration::from_millis(100));
        conn.on_opened(now + Duration::from_millis(100)).unwrap();
        conn.restart(now + Duration::from_millis(100));
        assert_eq!(
            conn.next_deadline(),
            Some(now + Duration::from_millis(300))
        );

        conn.begin_attempt(now + Duration::from_millis(300));
        conn.on_opened(now + Duration::from_millis(300)).unwrap();
        conn.on_progress();
        conn.restart(now + Duration::from_millis(300));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(mock.open_calls(), 5);
    }
}
