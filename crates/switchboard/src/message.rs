//! Wire records exchanged between client and server.
//!
//! Three record shapes cross the serializer boundary:
//!
//! - [`Message`] — a data frame in either direction.
//! - [`Reply`] — the server's response to a client `ref`.
//! - [`Broadcast`] — the pub/sub fan-out envelope; carries no refs.
//!
//! Payloads are [`serde_json::Value`] maps; the concrete wire framing is the
//! serializer's concern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The reserved control topic.
pub const PROTOCOL_TOPIC: &str = "phoenix";
/// Keep-alive event on the control topic.
pub const EVENT_HEARTBEAT: &str = "heartbeat";
/// Event initiating channel membership.
pub const EVENT_JOIN: &str = "phx_join";
/// Event gracefully leaving a channel.
pub const EVENT_LEAVE: &str = "phx_leave";
/// Server-originated frame signaling channel death.
pub const EVENT_ERROR: &str = "phx_error";
/// Server reply to a client ref.
pub const EVENT_REPLY: &str = "phx_reply";
/// Connection-level broadcast event forcing a disconnect.
pub const EVENT_DISCONNECT: &str = "disconnect";

/// A data frame: client-to-server or server-to-client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Reference of the join that established the channel this frame
    /// belongs to.
    pub join_ref: Option<String>,
    /// Reference of the individual request, when a reply is expected.
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
    /// The topic this frame is routed on.
    pub topic: String,
    /// The event name.
    pub event: String,
    /// The event payload.
    pub payload: Value,
}

impl Message {
    /// Create a message with no refs.
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Message {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// The `phx_error` frame emitted when a channel dies abnormally.
    ///
    /// Both refs carry the join ref so the client can correlate the failure
    /// with the channel instance it established.
    pub fn channel_error(topic: impl Into<String>, join_ref: Option<String>) -> Self {
        Message {
            join_ref: join_ref.clone(),
            msg_ref: join_ref,
            topic: topic.into(),
            event: EVENT_ERROR.into(),
            payload: Value::Object(Default::default()),
        }
    }
}

/// Status carried by a [`Reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Successful reply.
    Ok,
    /// Error reply.
    Error,
}

impl ReplyStatus {
    /// The wire spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
        }
    }
}

/// The server's response to a client `ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Reference of the join that established the channel.
    pub join_ref: Option<String>,
    /// Reference of the request being answered.
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
    /// The topic the request was routed on.
    pub topic: String,
    /// Reply status.
    pub status: ReplyStatus,
    /// Reply payload.
    pub payload: Value,
}

impl Reply {
    /// An `ok` reply.
    pub fn ok(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        payload: Value,
    ) -> Self {
        Reply {
            join_ref,
            msg_ref,
            topic: topic.into(),
            status: ReplyStatus::Ok,
            payload,
        }
    }

    /// An `error` reply.
    pub fn error(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        payload: Value,
    ) -> Self {
        Reply {
            join_ref,
            msg_ref,
            topic: topic.into(),
            status: ReplyStatus::Error,
            payload,
        }
    }
}

/// The pub/sub fan-out envelope. Carries no refs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    /// The topic published to.
    pub topic: String,
    /// The event name.
    pub event: String,
    /// The event payload.
    pub payload: Value,
}

impl Broadcast {
    /// Create a broadcast.
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Broadcast {
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }
}

/// Any server-originated record headed for the serializer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A data frame (push or `phx_error`).
    Message(Message),
    /// A reply to a client ref.
    Reply(Reply),
    /// A fan-out envelope delivered through a channel worker.
    Broadcast(Broadcast),
}
