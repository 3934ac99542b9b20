//! Transport layer abstraction.
//!
//! A transport wraps one bidirectional stream of binary frames. The engine
//! drives it through [`Transport`]; whatever happens asynchronously on the
//! wire (open completed, frame arrived, connection dropped) comes back as
//! a [`TransportEvent`] fed to the engine by its driver.

use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use livequery_protocol::ClientMessage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message-stream connection to the sync server.
pub trait Transport: Send + 'static {
    /// Starts opening a connection. Completion is reported later as
    /// [`TransportEvent::Opened`] or [`TransportEvent::Closed`].
    fn open(&mut self) -> ClientResult<()>;

    /// Sends one binary frame on the open connection.
    fn send(&mut self, frame: Bytes) -> ClientResult<()>;

    /// Closes the connection. Events from the closed connection must not
    /// be delivered afterwards.
    fn close(&mut self);
}

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is ready to carry frames.
    Opened,
    /// A frame arrived from the server.
    Frame(Bytes),
    /// The connection failed or was closed by the peer.
    Closed {
        /// Human-readable reason.
        reason: String,
    },
}

/// Creates a connected pair of event sender and receiver.
pub fn event_channel() -> (EventSender, TransportEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    let current = Arc::new(AtomicU64::new(0));
    (
        EventSender {
            tx,
            current: Arc::clone(&current),
        },
        TransportEvents { rx, current },
    )
}

/// Producer side of a transport event channel.
///
/// Each connection attempt gets a generation number; events tagged with an
/// older generation are dropped by [`TransportEvents`].
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    current: Arc<AtomicU64>,
}

impl EventSender {
    /// Starts a new generation, invalidating events of previous ones.
    pub fn next_generation(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidates events of the current generation without starting a
    /// connection.
    pub fn invalidate(&self) {
        self.next_generation();
    }

    /// The generation currently accepted.
    pub fn generation(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Emits an event tagged with `generation`.
    pub fn emit(&self, generation: u64, event: TransportEvent) {
        let _ = self.tx.send((generation, event));
    }
}

/// Consumer side of a transport event channel.
#[derive(Debug)]
pub struct TransportEvents {
    rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    current: Arc<AtomicU64>,
}

impl TransportEvents {
    /// Waits for the next event of the current generation.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            let (generation, event) = self.rx.recv().await?;
            if generation == self.current.load(Ordering::SeqCst) {
                return Some(event);
            }
            tracing::debug!(generation, "dropping event from stale connection");
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    open_calls: u32,
    close_calls: u32,
    fail_opens: bool,
    fail_sends: bool,
    sent: Vec<Bytes>,
}

/// A recording transport for tests.
///
/// Clones share state, so a test can keep one clone while the engine owns
/// another. Opening only records the call; the test reports completion by
/// feeding [`TransportEvent::Opened`] to the engine.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `open` calls fail.
    pub fn set_fail_opens(&self, fail: bool) {
        self.state.lock().fail_opens = fail;
    }

    /// Makes subsequent `send` calls fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Whether the transport was opened and not closed since.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of `open` calls so far.
    pub fn open_calls(&self) -> u32 {
        self.state.lock().open_calls
    }

    /// Number of `close` calls so far.
    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    /// Removes and returns the frames sent so far.
    pub fn take_frames(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Removes and decodes the frames sent so far.
    ///
    /// # Panics
    ///
    /// Panics if a recorded frame is not a valid client message.
    pub fn take_messages(&self) -> Vec<ClientMessage> {
        self.take_frames()
            .iter()
            .map(|frame| ClientMessage::decode(frame).expect("engine sent an undecodable frame"))
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> ClientResult<()> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if state.fail_opens {
            return Err(ClientError::transport_retryable("mock open failure"));
        }
        state.open = true;
        Ok(())
    }

    fn send(&mut self, frame: Bytes) -> ClientResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ClientError::transport_retryable("mock transport not open"));
        }
        if state.fail_sends {
            return Err(ClientError::transport_retryable("mock send failure"));
        }
        state.sent.push(frame);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_transport_records_frames() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();

        assert!(transport.send(Bytes::from_static(b"x")).is_err());

        transport.open().unwrap();
        assert!(mock.is_open());
        transport.send(Bytes::from_static(b"a")).unwrap();
        transport.send(Bytes::from_static(b"b")).unwrap();
        assert_eq!(mock.take_frames().len(), 2);
        assert!(mock.take_frames().is_empty());

        transport.close();
        assert!(!mock.is_open());
        assert_eq!(mock.open_calls(), 1);
        assert_eq!(mock.close_calls(), 1);
    }

    #[test]
    fn mock_transport_scripted_failures() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();

        mock.set_fail_opens(true);
        assert!(transport.open().is_err());
        assert!(!mock.is_open());

        mock.set_fail_opens(false);
        transport.open().unwrap();
        mock.set_fail_sends(true);
        let err = transport.send(Bytes::new()).unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn stale_generations_are_dropped() {
        let (sender, mut events) = event_channel();
        let first = sender.next_generation();
        sender.emit(first, TransportEvent::Opened);
        let second = sender.next_generation();
        sender.emit(first, TransportEvent::Frame(Bytes::from_static(b"old")));
        sender.emit(second, TransportEvent::Frame(Bytes::from_static(b"new")));

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Frame(Bytes::from_static(b"new")))
        );
    }
}
