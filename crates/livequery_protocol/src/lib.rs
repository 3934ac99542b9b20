//! # LiveQuery Protocol
//!
//! Wire messages, identifiers and subscription identities for the
//! LiveQuery sync client.
//!
//! The protocol is a single bidirectional stream of binary frames. The
//! client sends [`ClientMessage`]s (authentication, subscription changes,
//! mutations, actions, pings); the server answers with [`ServerMessage`]s
//! (ordered transitions, request responses, auth errors, pongs).
//!
//! ```
//! use livequery_codec::Value;
//! use livequery_protocol::{ClientMessage, QueryId, QuerySubscription};
//!
//! let message = ClientMessage::ModifySubscriptions {
//!     add: vec![QuerySubscription::new(
//!         QueryId::new(0),
//!         "messages.list",
//!         Value::object([("channel", Value::from("general"))]),
//!     )],
//!     remove: vec![],
//! };
//! let frame = message.encode().unwrap();
//! assert_eq!(ClientMessage::decode(&frame).unwrap(), message);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod fields;
mod identity;
mod ids;
mod messages;
mod modification;

pub use error::{ProtocolError, ProtocolResult};
pub use identity::{validate_function_path, QueryIdentity};
pub use ids::{LogPosition, QueryId, RequestId};
pub use messages::{ClientMessage, Outcome, QuerySubscription, ServerFailure, ServerMessage};
pub use modification::{DocumentChange, StateModification, DOCUMENT_ID_FIELD};
