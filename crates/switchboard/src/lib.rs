//! # Switchboard - Topic-multiplexed real-time channels
//!
//! Switchboard multiplexes many logical *topics* over a single long-lived
//! client connection. A client joins, exchanges messages with, and leaves
//! any number of named topics; each topic is handled server-side by an
//! isolated, independently-failing channel worker, and messages published to
//! a topic fan out to every connection subscribed to it.
//!
//! # Architecture
//!
//! - **[`Multiplexer`](mux::Multiplexer)**: the per-connection state machine.
//!   Owns the topic-to-worker maps, decodes inbound frames, routes them, and
//!   observes worker deaths.
//! - **[`Channel`](channel::Channel)**: the user's per-topic handler. The
//!   struct IS the channel state; `join` constructs it.
//! - **Channel worker**: one task per joined topic, with its own mailboxes.
//!   A worker crash surfaces to the client as a `phx_error` frame on that
//!   topic; the connection survives.
//! - **[`ChannelRegistry`](registry::ChannelRegistry)**: compiled routes
//!   from topic patterns (`"room:*"`) to channels, plus transport serializer
//!   declarations.
//! - **[`PubSub`](pubsub::PubSub)**: the bus boundary. Fan-out uses a
//!   *fastlane*: broadcasts are encoded once per serializer and written
//!   straight to each subscriber's transport, unless the subscribing channel
//!   intercepts the event to rewrite it in `handle_out`.
//! - **[`Serializer`](serializer::Serializer)**: the pluggable wire codec,
//!   negotiated per transport from semver requirements.
//!
//! # Example
//!
//! ```ignore
//! use switchboard::prelude::*;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct RoomChannel;
//!
//! #[async_trait]
//! impl Channel for RoomChannel {
//!     async fn join(_topic: &str, _payload: Value, _socket: &mut Socket) -> JoinResult<Self> {
//!         JoinResult::Ok(RoomChannel)
//!     }
//!
//!     async fn handle_in(&mut self, event: &str, payload: Value, socket: &mut Socket) -> HandleResult {
//!         let _ = socket.broadcast_from(event, payload.clone());
//!         HandleResult::ok(json!({}))
//!     }
//! }
//!
//! struct UserSocket;
//!
//! #[async_trait]
//! impl SocketHandler for UserSocket {
//!     async fn connect(&self, params: Value, socket: Socket, _info: &ConnectInfo)
//!         -> Result<Socket, ConnectError>
//!     {
//!         Ok(socket.assign("params", params))
//!     }
//!
//!     fn id(&self, _socket: &Socket) -> Option<String> {
//!         Some("users_socket:42".into())
//!     }
//! }
//!
//! let registry = ChannelRegistry::builder()
//!     .channel::<RoomChannel>("room:*", ChannelOpts::new())
//!     .transport("websocket", SerializerSpec::new()
//!         .with(JsonSerializer, "~2.0")
//!         .with(BinarySerializer, "~1.0"))
//!     .build();
//!
//! // One multiplexer per accepted connection; the transport drives it.
//! let config = SocketConfig {
//!     handler: Arc::new(UserSocket),
//!     registry: Arc::new(registry),
//!     bus: Arc::new(LocalBus::new()),
//!     serializer: Arc::new(JsonSerializer),
//!     options: SocketOptions::default(),
//! };
//! ```

#![deny(warnings)]
#![deny(missing_docs)]

/// Core types: worker identity, exit reasons, opaque terms.
pub mod core;

/// Wire records: `Message`, `Reply`, `Broadcast`.
pub mod message;

/// The pluggable wire codec boundary.
pub mod serializer;

/// Compiled topic routes and transport declarations.
pub mod registry;

/// The per-connection socket value and socket handler contract.
pub mod socket;

/// The channel handler contract and the per-topic worker runtime.
pub mod channel;

/// The pub/sub bus boundary and the in-process bus.
pub mod pubsub;

/// Broadcast fan-out with the fastlane optimization.
pub mod fanout;

/// The per-connection socket multiplexer.
pub mod mux;

// =============================================================================
// Re-exports for convenient top-level access
// =============================================================================

pub use crate::channel::worker::ChannelRef;
pub use crate::channel::{Channel, HandleResult, Hint, Info, JoinResult};
pub use crate::core::{ExitReason, ShutdownCause, Term, TransportSender, WorkerId};
pub use crate::message::{Broadcast, Message, Outbound, Reply, ReplyStatus};
pub use crate::mux::{Flow, Multiplexer, SocketConfig, SocketEvent, SocketOptions};
pub use crate::pubsub::{Fastlane, LocalBus, PubSub, Subscriber};
pub use crate::registry::{ChannelOpts, ChannelRegistry, TopicPattern};
pub use crate::serializer::{Frame, Opcode, Serializer, SerializerSpec};
pub use crate::socket::{Assigns, ConnectError, ConnectInfo, Socket, SocketHandler};

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```ignore
/// use switchboard::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::{Channel, HandleResult, Hint, Info, JoinResult};
    pub use crate::core::{ExitReason, Term, WorkerId};
    pub use crate::message::{Broadcast, Message, Reply, ReplyStatus};
    pub use crate::mux::{Flow, Multiplexer, SocketConfig, SocketEvent, SocketOptions};
    pub use crate::pubsub::{LocalBus, PubSub};
    pub use crate::registry::{ChannelOpts, ChannelRegistry};
    pub use crate::serializer::binary::BinarySerializer;
    pub use crate::serializer::json::JsonSerializer;
    pub use crate::serializer::{Serializer, SerializerSpec};
    pub use crate::socket::{ConnectError, ConnectInfo, Socket, SocketHandler};
    pub use async_trait::async_trait;
}
