//! WebSocket transport built on `tokio-tungstenite`.
//!
//! Each `open` spawns one connection task tagged with a fresh generation.
//! The task reports `Opened`, every binary frame, and finally `Closed`
//! through the shared event channel; `close` aborts it and bumps the
//! generation so nothing it already queued reaches the engine.

use crate::error::{ClientError, ClientResult};
use crate::transport::{event_channel, EventSender, Transport, TransportEvent, TransportEvents};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

/// Transport over a single WebSocket connection.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: String,
    events: EventSender,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Creates a transport for `url` and the event stream it reports to.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless the URL uses `ws://` or `wss://`.
    pub fn new(url: impl Into<String>) -> ClientResult<(Self, TransportEvents)> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ClientError::invalid_argument(format!(
                "websocket url must start with ws:// or wss://, got {url:?}"
            )));
        }
        let (events, receiver) = event_channel();
        Ok((
            Self {
                url,
                events,
                outgoing: None,
                task: None,
            },
            receiver,
        ))
    }

    /// The server URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self) -> ClientResult<()> {
        self.close();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ClientError::transport_fatal("websocket transport needs a tokio runtime"))?;
        let generation = self.events.next_generation();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(tx);
        self.task = Some(runtime.spawn(connection_task(
            self.url.clone(),
            generation,
            self.events.clone(),
            rx,
        )));
        Ok(())
    }

    fn send(&mut self, frame: Bytes) -> ClientResult<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| ClientError::transport_retryable("websocket not open"))?;
        outgoing
            .send(frame)
            .map_err(|_| ClientError::transport_retryable("websocket writer stopped"))
    }

    fn close(&mut self) {
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.invalidate();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn connection_task(
    url: String,
    generation: u64,
    events: EventSender,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
) {
    debug!(%url, generation, "connecting");
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            events.emit(
                generation,
                TransportEvent::Closed {
                    reason: format!("connect failed: {err}"),
                },
            );
            return;
        }
    };
    events.emit(generation, TransportEvent::Opened);

    let (mut sink, mut source) = stream.split();
    let reason = loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(Message::Binary(frame)).await {
                        break format!("send failed: {err}");
                    }
                }
                None => {
                    // Closed locally; nobody listens for events any more.
                    let _ = sink.close().await;
                    return;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    events.emit(generation, TransportEvent::Frame(data));
                }
                Some(Ok(Message::Text(text))) => {
                    warn!(len = text.len(), "unexpected text frame ignored");
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || "server closed connection".to_string(),
                        |f| format!("server closed connection: {}", f.reason),
                    );
                }
                Some(Err(err)) => break format!("websocket error: {err}"),
                None => break "websocket stream ended".to_string(),
            },
        }
    };
    events.emit(generation, TransportEvent::Closed { reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            WebSocketTransport::new("http://localhost"),
            Err(ClientError::InvalidArgument(_))
        ));
        let (transport, _) = WebSocketTransport::new("ws://localhost:3210/sync").unwrap();
        assert_eq!(transport.url(), "ws://localhost:3210/sync");
    }

    #[test]
    fn send_before_open_fails() {
        let (mut transport, _) = WebSocketTransport::new("ws://localhost:1").unwrap();
        assert!(transport.send(Bytes::from_static(b"x")).unwrap_err().is_retryable());
    }

    #[test]
    fn open_without_runtime_is_an_error() {
        let (mut transport, _) = WebSocketTransport::new("ws://localhost:1").unwrap();
        assert!(transport.open().is_err());
    }

    #[tokio::test]
    async fn unreachable_server_reports_closed() {
        // Port 1 on loopback is reserved and refuses connections.
        let (mut transport, mut events) = WebSocketTransport::new("ws://127.0.0.1:1").unwrap();
        transport.open().unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Closed { .. }));
    }
}
