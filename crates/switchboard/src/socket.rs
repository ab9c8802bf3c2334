//! The per-connection socket value and the user's socket handler.
//!
//! A [`Socket`] is a value with copy-on-modify semantics: the multiplexer
//! owns the connection-level socket, and every channel worker owns its own
//! clone stamped with the joined topic, join ref, and channel metadata.
//! `assigns` is user scratch space; `private` is framework scratch space
//! seeded from the channel's metadata.
//!
//! The [`SocketHandler`] trait is the user's connection-level module: it
//! authorizes the connection and names it for connection-wide broadcasts
//! such as forced disconnects.

use crate::core::{TransportSender, WorkerId};
use crate::message::{Broadcast, Message, Outbound};
use crate::pubsub::{PubSub, PubSubError};
use crate::serializer::{SerializeError, Serializer};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// User and framework scratch space: symbolic keys to arbitrary values.
pub type Assigns = HashMap<String, Value>;

/// Connection metadata handed to `connect`.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    /// Transport kind tag, used in log lines.
    pub transport: &'static str,
    /// Remote peer address, when the transport knows it.
    pub peer_addr: Option<String>,
    /// Extra transport-specific metadata.
    pub custom: HashMap<String, String>,
}

/// Errors establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The handler's `connect` callback refused the connection.
    #[error("connection refused")]
    Refused,
}

/// Errors from socket-level sends.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The socket has not joined a topic yet.
    #[error("socket has not joined a topic")]
    NotJoined,
    /// The transport is gone.
    #[error("transport closed")]
    TransportClosed,
    /// The outbound record failed to encode.
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    /// The bus rejected the publish.
    #[error(transparent)]
    Bus(#[from] PubSubError),
}

/// The per-connection (and, inside a worker, per-channel) socket value.
#[derive(Clone)]
pub struct Socket {
    /// Stable connection identifier, set from the handler's `id` callback.
    pub id: Option<String>,
    /// User scratch space.
    pub assigns: Assigns,
    /// Framework scratch space, seeded from channel metadata on join.
    pub private: Assigns,
    /// The joined topic. Empty until a join succeeds.
    pub topic: String,
    /// True after a successful join.
    pub joined: bool,
    /// Ref of the join that established this channel.
    pub join_ref: Option<String>,
    /// Ref of the inbound message currently being handled.
    pub msg_ref: Option<String>,
    /// Name of the channel module handling the topic, set inside a worker.
    pub channel: Option<&'static str>,
    /// Identity of the owning channel worker, set inside a worker.
    pub channel_id: Option<WorkerId>,
    /// Transport kind tag for logging.
    pub transport: &'static str,
    pub(crate) transport_tx: Option<TransportSender>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) bus: Arc<dyn PubSub>,
}

impl Socket {
    /// Create a connection-level socket.
    pub fn new(
        serializer: Arc<dyn Serializer>,
        bus: Arc<dyn PubSub>,
        transport: &'static str,
    ) -> Self {
        Socket {
            id: None,
            assigns: Assigns::new(),
            private: Assigns::new(),
            topic: String::new(),
            joined: false,
            join_ref: None,
            msg_ref: None,
            channel: None,
            channel_id: None,
            transport,
            transport_tx: None,
            serializer,
            bus,
        }
    }

    /// Store a value in `assigns`, chainable from `connect` and `join`.
    pub fn assign(mut self, key: impl Into<String>, value: Value) -> Self {
        self.assigns.insert(key.into(), value);
        self
    }

    /// Look up an assign.
    pub fn get_assign(&self, key: &str) -> Option<&Value> {
        self.assigns.get(key)
    }

    /// The codec negotiated for this connection.
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// The pub/sub bus this connection publishes through.
    pub fn bus(&self) -> &Arc<dyn PubSub> {
        &self.bus
    }

    /// Push an event straight to this connection's client.
    ///
    /// Valid inside a joined channel; the frame is stamped with the
    /// channel's join ref so the client routes it to the right instance.
    pub fn push(&self, event: impl Into<String>, payload: Value) -> Result<(), SocketError> {
        if !self.joined {
            return Err(SocketError::NotJoined);
        }
        let transport = self
            .transport_tx
            .as_ref()
            .ok_or(SocketError::TransportClosed)?;

        let msg = Message {
            join_ref: self.join_ref.clone(),
            msg_ref: None,
            topic: self.topic.clone(),
            event: event.into(),
            payload,
        };
        let frame = self.serializer.encode(&Outbound::Message(msg))?.into_frame();
        transport
            .send(frame)
            .map_err(|_| SocketError::TransportClosed)
    }

    /// Broadcast an event to every subscriber of this socket's topic,
    /// including this connection.
    pub fn broadcast(&self, event: impl Into<String>, payload: Value) -> Result<(), SocketError> {
        if !self.joined {
            return Err(SocketError::NotJoined);
        }
        self.bus
            .publish(None, Broadcast::new(self.topic.clone(), event, payload))?;
        Ok(())
    }

    /// Broadcast an event to every subscriber except this channel.
    pub fn broadcast_from(
        &self,
        event: impl Into<String>,
        payload: Value,
    ) -> Result<(), SocketError> {
        if !self.joined {
            return Err(SocketError::NotJoined);
        }
        self.bus.publish(
            self.channel_id,
            Broadcast::new(self.topic.clone(), event, payload),
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("joined", &self.joined)
            .field("join_ref", &self.join_ref)
            .field("msg_ref", &self.msg_ref)
            .field("channel", &self.channel)
            .field("channel_id", &self.channel_id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// The user's connection-level module.
///
/// `connect` authorizes the connection and seeds its assigns; `id` names the
/// connection. Returning a name subscribes the multiplexer to that topic so
/// connection-wide events (for example a `disconnect` broadcast) reach it.
/// The typed `Option<String>` return is the only accepted shape; there is no
/// other-shape protocol error to handle at runtime.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// Authorize a connection and prepare its socket.
    async fn connect(
        &self,
        params: Value,
        socket: Socket,
        info: &ConnectInfo,
    ) -> Result<Socket, ConnectError>;

    /// Name the connection, or `None` for anonymous connections.
    fn id(&self, socket: &Socket) -> Option<String>;
}
