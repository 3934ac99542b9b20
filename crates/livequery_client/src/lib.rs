//! # LiveQuery Client
//!
//! Client-side sync engine for a reactive query platform.
//!
//! This crate provides:
//! - Connection state machine (connect, authenticate, heartbeat, reconnect
//!   with backoff)
//! - Query subscription registry with deduplication by canonical identity
//! - Local reactive store applying ordered, gap-checked transitions
//! - Optimistic mutation queue with rollback and reconciliation
//! - A tokio runtime driver and a WebSocket transport
//!
//! ## Architecture
//!
//! [`SyncEngine`] is the sans-IO core. It owns a [`Transport`] and reacts
//! to three kinds of input:
//! 1. Transport events (`Opened`, `Frame`, `Closed`)
//! 2. Timer checks via `tick()`, scheduled from `next_deadline()`
//! 3. Caller operations (`subscribe`, `mutate`, ...)
//!
//! [`Client`] runs an engine on a tokio task and exposes the same
//! operations as async methods.
//!
//! ## Key Invariants
//!
//! - Server is authoritative; optimistic updates are always re-derived
//!   from the latest server state
//! - Transitions apply only in gap-free log position order; a gap forces
//!   a full resync
//! - Every request resolves exactly once
//! - Reconnecting resubscribes every live query in one message

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod connection;
mod engine;
mod error;
mod mutations;
mod registry;
mod runtime;
mod store;
mod transport;
mod ws;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffConfig, ClientConfig, HeartbeatConfig};
pub use connection::{ConnectionState, StateObserver};
pub use engine::{AuthErrorHandler, ClientStats, SyncEngine};
pub use error::{ClientError, ClientResult};
pub use mutations::{PendingResult, RequestKind, RequestState};
pub use registry::{Listener, SubscriptionHandle};
pub use runtime::{Client, QueryWatch, Subscription};
pub use store::{LocalQueryView, OptimisticUpdate, QueryResult, QuerySnapshot, TransitionError};
pub use transport::{
    event_channel, EventSender, MockTransport, Transport, TransportEvent, TransportEvents,
};
pub use ws::WebSocketTransport;

pub use livequery_codec::Value;
pub use livequery_protocol::{LogPosition, QueryId, RequestId};
