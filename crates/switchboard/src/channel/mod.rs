//! The channel handler contract.
//!
//! A channel is a server-side handler for topics matching a pattern. The
//! struct implementing [`Channel`] IS the per-topic state: `join` constructs
//! it, and the runtime calls its handlers with `&mut self` plus the worker's
//! own [`Socket`] clone.
//!
//! # Example
//!
//! ```ignore
//! use switchboard::prelude::*;
//! use serde_json::{json, Value};
//!
//! struct RoomChannel {
//!     messages: u64,
//! }
//!
//! #[async_trait]
//! impl Channel for RoomChannel {
//!     const INTERCEPTS: &'static [&'static str] = &["new_msg"];
//!
//!     async fn join(_topic: &str, _payload: Value, _socket: &mut Socket) -> JoinResult<Self> {
//!         JoinResult::Ok(RoomChannel { messages: 0 })
//!     }
//!
//!     async fn handle_in(&mut self, event: &str, payload: Value, socket: &mut Socket) -> HandleResult {
//!         match event {
//!             "new_msg" => {
//!                 self.messages += 1;
//!                 let _ = socket.broadcast_from("new_msg", payload);
//!                 HandleResult::ok(json!({}))
//!             }
//!             _ => HandleResult::NoReply,
//!         }
//!     }
//! }
//! ```

pub mod worker;

use crate::core::{ExitReason, Term};
use crate::message::ReplyStatus;
use crate::socket::{Assigns, Socket};
use async_trait::async_trait;
use serde_json::Value;
use std::marker::PhantomData;
use std::time::Duration;

/// Result of a join attempt. The channel struct is constructed here.
#[derive(Debug)]
pub enum JoinResult<C> {
    /// Join succeeded; the client gets an empty `ok` reply.
    Ok(C),
    /// Join succeeded with a reply payload.
    OkReply(C, Value),
    /// Join refused; the payload goes back in an `error` reply and no
    /// worker is registered.
    Error(Value),
}

/// Loop hint attached to a `noreply` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// Compact worker-owned memory. Best effort.
    Hibernate,
    /// Deliver [`Info::Timeout`] if no message arrives within the duration.
    Timeout(Duration),
}

/// Result of `handle_in`, `handle_out`, and `handle_info`.
///
/// Reply-carrying variants are only valid from `handle_in`; returning one
/// elsewhere, or without a pending inbound ref, is a programmer error and
/// crashes the channel worker.
#[derive(Debug)]
pub enum HandleResult {
    /// Continue without replying.
    NoReply,
    /// Continue without replying, with a loop hint.
    NoReplyHint(Hint),
    /// Reply to the inbound ref.
    Reply(ReplyStatus, Value),
    /// Stop the worker.
    Stop(ExitReason),
    /// Reply, then stop the worker.
    StopReply(ExitReason, ReplyStatus, Value),
}

impl HandleResult {
    /// An `ok` reply.
    pub fn ok(payload: Value) -> Self {
        HandleResult::Reply(ReplyStatus::Ok, payload)
    }

    /// An `error` reply.
    pub fn error(payload: Value) -> Self {
        HandleResult::Reply(ReplyStatus::Error, payload)
    }
}

/// A message delivered to `handle_info`.
#[derive(Debug, Clone)]
pub enum Info {
    /// The idle timeout requested via [`Hint::Timeout`] fired.
    Timeout,
    /// An out-of-band term from another task.
    User(Term),
}

/// The user's channel module.
#[async_trait]
pub trait Channel: Sized + Send + 'static {
    /// Events this channel intercepts: broadcasts for these events bypass
    /// the fastlane and run through [`Channel::handle_out`].
    const INTERCEPTS: &'static [&'static str] = &[];

    /// Initial framework scratch space installed into `socket.private` on
    /// join.
    fn private() -> Assigns {
        Assigns::new()
    }

    /// Authorize a join and construct the channel state.
    ///
    /// The socket already carries the topic, join ref, and merged assigns.
    async fn join(topic: &str, payload: Value, socket: &mut Socket) -> JoinResult<Self>;

    /// Handle an event sent by the client. `socket.msg_ref` holds the ref
    /// the client expects a reply on.
    async fn handle_in(&mut self, event: &str, payload: Value, socket: &mut Socket)
        -> HandleResult;

    /// Handle an intercepted broadcast.
    ///
    /// The default pushes the broadcast through to the client unchanged, so
    /// channels only intercept events they rewrite or suppress.
    async fn handle_out(
        &mut self,
        event: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> HandleResult {
        if let Err(e) = socket.push(event, payload) {
            tracing::debug!(topic = %socket.topic, event = %event, error = %e, "push dropped");
        }
        HandleResult::NoReply
    }

    /// Handle an out-of-band message.
    async fn handle_info(&mut self, _info: Info, _socket: &mut Socket) -> HandleResult {
        HandleResult::NoReply
    }

    /// Called when the worker stops, with the reason it is stopping for.
    async fn terminate(&mut self, _reason: &ExitReason, _socket: &mut Socket) {}

    /// Live upgrade hook. The runtime never calls this on its own.
    fn code_change(&mut self, _old_vsn: &str, _socket: &mut Socket, _extra: Value) {}
}

// ============================================================================
// Type erasure
// ============================================================================

/// Type-erased channel constructor stored in the registry.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// The channel type's name, for diagnostics.
    fn channel_name(&self) -> &'static str;

    /// Events the channel intercepts.
    fn intercepts(&self) -> &'static [&'static str];

    /// Initial `socket.private` contents.
    fn private(&self) -> Assigns;

    /// Run the join callback. `Ok` carries the running instance and the
    /// reply payload; `Err` carries the refusal payload.
    async fn join(
        &self,
        topic: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<(Box<dyn RunningChannel>, Value), Value>;
}

/// A running, type-erased channel instance.
#[async_trait]
pub trait RunningChannel: Send {
    /// Dispatch a client event.
    async fn handle_in(&mut self, event: &str, payload: Value, socket: &mut Socket)
        -> HandleResult;

    /// Dispatch an intercepted broadcast.
    async fn handle_out(&mut self, event: &str, payload: Value, socket: &mut Socket)
        -> HandleResult;

    /// Dispatch an out-of-band message.
    async fn handle_info(&mut self, info: Info, socket: &mut Socket) -> HandleResult;

    /// Run the terminate callback.
    async fn terminate(&mut self, reason: &ExitReason, socket: &mut Socket);
}

/// Bridges a typed [`Channel`] to the erased [`ChannelFactory`].
pub struct TypedChannelFactory<C: Channel> {
    _marker: PhantomData<fn() -> C>,
}

impl<C: Channel> TypedChannelFactory<C> {
    /// Create the factory.
    pub fn new() -> Self {
        TypedChannelFactory {
            _marker: PhantomData,
        }
    }
}

impl<C: Channel> Default for TypedChannelFactory<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Channel> ChannelFactory for TypedChannelFactory<C> {
    fn channel_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn intercepts(&self) -> &'static [&'static str] {
        C::INTERCEPTS
    }

    fn private(&self) -> Assigns {
        C::private()
    }

    async fn join(
        &self,
        topic: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<(Box<dyn RunningChannel>, Value), Value> {
        match C::join(topic, payload, socket).await {
            JoinResult::Ok(channel) => Ok((
                Box::new(Running { channel }),
                Value::Object(Default::default()),
            )),
            JoinResult::OkReply(channel, reply) => Ok((Box::new(Running { channel }), reply)),
            JoinResult::Error(reply) => Err(reply),
        }
    }
}

struct Running<C: Channel> {
    channel: C,
}

#[async_trait]
impl<C: Channel> RunningChannel for Running<C> {
    async fn handle_in(
        &mut self,
        event: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> HandleResult {
        self.channel.handle_in(event, payload, socket).await
    }

    async fn handle_out(
        &mut self,
        event: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> HandleResult {
        self.channel.handle_out(event, payload, socket).await
    }

    async fn handle_info(&mut self, info: Info, socket: &mut Socket) -> HandleResult {
        self.channel.handle_info(info, socket).await
    }

    async fn terminate(&mut self, reason: &ExitReason, socket: &mut Socket) {
        self.channel.terminate(reason, socket).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::LocalBus;
    use crate::serializer::json::JsonSerializer;
    use serde_json::json;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl Channel for Echo {
        const INTERCEPTS: &'static [&'static str] = &["shout"];

        async fn join(_topic: &str, payload: Value, _socket: &mut Socket) -> JoinResult<Self> {
            if payload.get("deny").is_some() {
                JoinResult::Error(json!({"reason": "denied"}))
            } else {
                JoinResult::OkReply(Echo, json!({"welcome": true}))
            }
        }

        async fn handle_in(
            &mut self,
            _event: &str,
            payload: Value,
            _socket: &mut Socket,
        ) -> HandleResult {
            HandleResult::ok(payload)
        }
    }

    fn socket() -> Socket {
        Socket::new(Arc::new(JsonSerializer), Arc::new(LocalBus::new()), "test")
    }

    #[tokio::test]
    async fn factory_reports_metadata() {
        let factory = TypedChannelFactory::<Echo>::new();
        assert_eq!(factory.intercepts(), &["shout"]);
        assert!(factory.private().is_empty());
        assert!(factory.channel_name().contains("Echo"));
    }

    #[tokio::test]
    async fn factory_join_maps_results() {
        let factory = TypedChannelFactory::<Echo>::new();
        let mut socket = socket();

        let (mut instance, reply) = factory
            .join("room:1", json!({}), &mut socket)
            .await
            .expect("join should succeed");
        assert_eq!(reply, json!({"welcome": true}));

        let result = instance
            .handle_in("echo", json!({"x": 1}), &mut socket)
            .await;
        assert!(matches!(result, HandleResult::Reply(ReplyStatus::Ok, p) if p == json!({"x": 1})));

        let refused = factory
            .join("room:1", json!({"deny": true}), &mut socket)
            .await;
        assert!(matches!(refused, Err(p) if p == json!({"reason": "denied"})));
    }
}
