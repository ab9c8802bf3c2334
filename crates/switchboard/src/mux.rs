//! The socket multiplexer: the per-connection state machine.
//!
//! One multiplexer exists per transport connection. It owns the map from
//! joined topics to channel workers (and its inverse), decodes inbound
//! frames, routes them, observes worker deaths, and emits outbound frames.
//!
//! The owning connection task drives it:
//!
//! 1. [`Multiplexer::connect`] runs the handler's `connect`/`id` callbacks.
//! 2. [`Multiplexer::init`] records the transport handle and subscribes the
//!    connection to its id topic.
//! 3. Each inbound transport frame goes through [`Multiplexer::handle_in`];
//!    each event from [`Multiplexer::take_events`] (worker deaths, pushes)
//!    and each broadcast from [`Multiplexer::take_broadcasts`] goes through
//!    [`Multiplexer::handle_info`].
//! 4. On transport close, [`Multiplexer::terminate`] force-closes every
//!    channel worker before the task returns.
//!
//! The two maps are updated together, always: for every `topic -> worker`
//! entry there is exactly one `worker -> (topic, join_ref)` entry and vice
//! versa. Death notifications for workers no longer in the maps are ignored,
//! which is what makes deliberate removal (leave, duplicate join, forced
//! close) race-free against late exits.

use crate::channel::worker::{self, ChannelRef, JoinOutcome, JoinRequest, WorkerHandle, WorkerMessage};
use crate::core::{ExitReason, TransportSender, WorkerId};
use crate::message::{
    Broadcast, Message, Outbound, Reply, EVENT_DISCONNECT, EVENT_HEARTBEAT, EVENT_JOIN,
    PROTOCOL_TOPIC,
};
use crate::pubsub::{PubSub, Subscriber};
use crate::registry::ChannelRegistry;
use crate::serializer::{Frame, Serializer};
use crate::socket::{ConnectError, ConnectInfo, Socket, SocketHandler};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// How long a forced close waits before killing a worker.
    pub close_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything a connection needs: the user's socket handler, its compiled
/// registry, the bus, the negotiated codec, and options.
#[derive(Clone)]
pub struct SocketConfig {
    /// The user's connection-level module.
    pub handler: Arc<dyn SocketHandler>,
    /// The handler module's compiled channel registry.
    pub registry: Arc<ChannelRegistry>,
    /// The pub/sub bus.
    pub bus: Arc<dyn PubSub>,
    /// The codec negotiated for this connection.
    pub serializer: Arc<dyn Serializer>,
    /// Connection tunables.
    pub options: SocketOptions,
}

/// Asynchronous events arriving at the multiplexer.
#[derive(Debug)]
pub enum SocketEvent {
    /// A worker died abnormally (death watch).
    ChannelExit {
        /// The dead worker.
        worker: WorkerId,
        /// Why it died.
        reason: ExitReason,
    },
    /// A worker stopped for a normal reason, optionally carrying its final
    /// reply frame.
    GracefulExit {
        /// The stopping worker.
        worker: WorkerId,
        /// Final outbound record to emit after cleanup.
        frame: Option<Outbound>,
    },
    /// A broadcast delivered on the connection's id topic.
    Broadcast(Broadcast),
    /// A pre-encoded frame to emit verbatim.
    SocketPush(Frame),
    /// Best-effort memory compaction hint.
    GarbageCollect,
}

/// What the caller should do after an async event.
#[derive(Debug)]
pub enum Flow {
    /// Emit these frames and keep going.
    Continue(Vec<Frame>),
    /// Emit these frames, then stop the connection (which terminates every
    /// channel worker).
    Stop(Vec<Frame>),
}

/// The per-connection multiplexer.
pub struct Multiplexer {
    config: SocketConfig,
    socket: Socket,
    /// Identity used for the connection's own bus subscription.
    mux_id: WorkerId,
    channels: HashMap<String, WorkerHandle>,
    channels_inverse: HashMap<WorkerId, (String, Option<String>)>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    broadcasts_rx: Option<mpsc::UnboundedReceiver<Broadcast>>,
}

impl Multiplexer {
    /// Establish a connection: run the handler's `connect`, then `id`.
    ///
    /// A refusal from `connect` fails the connection; the transport should
    /// drop it.
    pub async fn connect(
        config: SocketConfig,
        params: Value,
        info: ConnectInfo,
    ) -> Result<Multiplexer, ConnectError> {
        let socket = Socket::new(config.serializer.clone(), config.bus.clone(), info.transport);
        let mut socket = config.handler.connect(params, socket, &info).await?;
        socket.id = config.handler.id(&socket);

        tracing::debug!(
            transport = info.transport,
            id = socket.id.as_deref().unwrap_or("-"),
            "connected"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Multiplexer {
            config,
            socket,
            mux_id: WorkerId::next(),
            channels: HashMap::new(),
            channels_inverse: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            broadcasts_rx: None,
        })
    }

    /// Record the transport handle and subscribe to the connection's id
    /// topic (used for connection-wide events such as forced disconnects).
    pub fn init(&mut self, transport: TransportSender) {
        self.socket.transport_tx = Some(transport);

        if let Some(id_topic) = self.socket.id.clone() {
            let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
            self.config.bus.subscribe(
                &id_topic,
                Subscriber {
                    id: self.mux_id,
                    broadcasts: broadcast_tx,
                    fastlane: None,
                },
            );
            self.broadcasts_rx = Some(broadcast_rx);
        }
    }

    /// The connection-level socket value.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Topics with a live channel worker.
    pub fn joined_topics(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    /// A handle to the worker for a topic, for out-of-band info terms.
    pub fn channel_ref(&self, topic: &str) -> Option<ChannelRef> {
        self.channels.get(topic).map(WorkerHandle::channel_ref)
    }

    /// Sender for injecting [`SocketEvent`]s (pushes, GC hints) from other
    /// tasks.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SocketEvent> {
        self.events_tx.clone()
    }

    /// Take the event mailbox. The driving task owns it and feeds every
    /// event back through [`Multiplexer::handle_info`].
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.events_rx.take()
    }

    /// Take the id-topic broadcast mailbox, present after [`Multiplexer::init`]
    /// when the handler named the connection.
    pub fn take_broadcasts(&mut self) -> Option<mpsc::UnboundedReceiver<Broadcast>> {
        self.broadcasts_rx.take()
    }

    /// Decode and dispatch one inbound transport frame, returning the reply
    /// frames to emit.
    pub async fn handle_in(&mut self, frame: Frame) -> Vec<Frame> {
        let msg = match self.socket.serializer.decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(transport = self.socket.transport, error = %e, "undecodable frame");
                return Vec::new();
            }
        };

        if msg.topic == PROTOCOL_TOPIC && msg.event == EVENT_HEARTBEAT {
            let reply = Reply::ok(msg.join_ref, msg.msg_ref, PROTOCOL_TOPIC, json!({}));
            return self.encode(Outbound::Reply(reply));
        }

        if msg.event == EVENT_JOIN {
            return self.handle_join(msg).await;
        }

        match self.channels.get(&msg.topic) {
            Some(handle) => {
                if handle.control.send(WorkerMessage::Inbound(msg)).is_err() {
                    // The worker is dying; its exit notification is already
                    // on the way and will clean the maps up.
                    tracing::trace!("message for terminating channel dropped");
                }
                Vec::new()
            }
            None => self.unmatched(msg),
        }
    }

    /// Handle an asynchronous event.
    pub async fn handle_info(&mut self, event: SocketEvent) -> Flow {
        match event {
            SocketEvent::ChannelExit { worker, reason } => {
                match self.channels_inverse.remove(&worker) {
                    Some((topic, join_ref)) => {
                        self.channels.remove(&topic);
                        tracing::error!(
                            worker = %worker,
                            topic = %topic,
                            reason = %reason,
                            "channel terminated abnormally"
                        );
                        let frame = Message::channel_error(topic, join_ref);
                        Flow::Continue(self.encode(Outbound::Message(frame)))
                    }
                    // Already removed deliberately; a late death is not an
                    // error the client should hear about.
                    None => Flow::Continue(Vec::new()),
                }
            }
            SocketEvent::GracefulExit { worker, frame } => {
                if let Some((topic, _)) = self.channels_inverse.remove(&worker) {
                    self.channels.remove(&topic);
                }
                let frames = frame.map(|out| self.encode(out)).unwrap_or_default();
                Flow::Continue(frames)
            }
            SocketEvent::Broadcast(broadcast) => {
                if self.socket.id.as_deref() == Some(broadcast.topic.as_str())
                    && broadcast.event == EVENT_DISCONNECT
                {
                    tracing::debug!(id = %broadcast.topic, "disconnect requested; stopping");
                    return Flow::Stop(Vec::new());
                }
                Flow::Continue(Vec::new())
            }
            SocketEvent::SocketPush(frame) => Flow::Continue(vec![frame]),
            SocketEvent::GarbageCollect => {
                self.channels.shrink_to_fit();
                self.channels_inverse.shrink_to_fit();
                Flow::Continue(Vec::new())
            }
        }
    }

    /// Force-close every channel worker. Returns when all are dead.
    pub async fn terminate(&mut self) {
        if let Some(id_topic) = &self.socket.id {
            self.config.bus.unsubscribe(id_topic, self.mux_id);
        }

        let handles: Vec<WorkerHandle> = self.channels.drain().map(|(_, h)| h).collect();
        self.channels_inverse.clear();
        worker::close_channels(handles, self.config.options.close_timeout).await;
    }

    async fn handle_join(&mut self, msg: Message) -> Vec<Frame> {
        if let Some(existing) = self.channels.remove(&msg.topic) {
            tracing::debug!(topic = %msg.topic, "duplicate join; closing existing channel");
            self.channels_inverse.remove(&existing.id);
            worker::close_channels(vec![existing], self.config.options.close_timeout).await;
        }

        let Some((factory, opts)) = self.config.registry.lookup(&msg.topic) else {
            return self.unmatched(msg);
        };

        let join_ref = msg.msg_ref.clone();
        let (handle, outcome_rx) = worker::spawn(JoinRequest {
            factory,
            opts: opts.clone(),
            topic: msg.topic.clone(),
            join_ref: join_ref.clone(),
            payload: msg.payload,
            socket: self.socket.clone(),
            events: self.events_tx.clone(),
        });

        let outcome = outcome_rx
            .await
            .unwrap_or_else(|_| JoinOutcome::Crashed("channel exited during join".into()));

        let reply = match outcome {
            JoinOutcome::Ok(payload) => {
                self.channels_inverse
                    .insert(handle.id, (msg.topic.clone(), join_ref.clone()));
                self.channels.insert(msg.topic.clone(), handle);
                Reply::ok(join_ref, msg.msg_ref, msg.topic, payload)
            }
            JoinOutcome::Refused(payload) => {
                Reply::error(join_ref, msg.msg_ref, msg.topic, payload)
            }
            JoinOutcome::Crashed(trace) => {
                tracing::error!(topic = %msg.topic, error = %trace, "channel join crashed");
                Reply::error(
                    join_ref,
                    msg.msg_ref,
                    msg.topic,
                    json!({"reason": "join crashed"}),
                )
            }
        };
        self.encode(Outbound::Reply(reply))
    }

    fn unmatched(&self, msg: Message) -> Vec<Frame> {
        tracing::warn!(
            topic = %msg.topic,
            event = %msg.event,
            transport = self.socket.transport,
            "unmatched topic"
        );
        let reply = Reply::error(
            msg.join_ref,
            msg.msg_ref,
            msg.topic,
            json!({"reason": "unmatched topic"}),
        );
        self.encode(Outbound::Reply(reply))
    }

    fn encode(&self, out: Outbound) -> Vec<Frame> {
        match self.socket.serializer.encode(&out) {
            Ok(encoded) => vec![encoded.into_frame()],
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound frame");
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    fn assert_bijection(&self) {
        assert_eq!(self.channels.len(), self.channels_inverse.len());
        for (topic, handle) in &self.channels {
            let (inverse_topic, _) = self
                .channels_inverse
                .get(&handle.id)
                .expect("channel without inverse entry");
            assert_eq!(inverse_topic, topic);
        }
    }
}
