//! # LiveQuery Testkit
//!
//! Test utilities for the LiveQuery sync client.
//!
//! This crate provides:
//! - An in-memory fake server speaking the wire protocol
//! - Fixtures for documents, arguments and server frames
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use livequery_protocol::{ClientMessage, QueryId, QuerySubscription, ServerMessage};
//! use livequery_testkit::prelude::*;
//!
//! let mut server = FakeServer::with_messages();
//! let subscribe = ClientMessage::ModifySubscriptions {
//!     add: vec![QuerySubscription::new(QueryId::new(0), "messages.list", channel_args("general"))],
//!     remove: vec![],
//! };
//! let replies = server.receive(&subscribe.encode().unwrap()).unwrap();
//! assert!(matches!(
//!     ServerMessage::decode(&replies[0]).unwrap(),
//!     ServerMessage::Transition { .. }
//! ));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;
pub mod tracing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
    pub use crate::tracing::init_tracing;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
pub use tracing::init_tracing;
