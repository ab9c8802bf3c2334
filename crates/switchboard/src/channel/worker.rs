//! The per-topic channel worker.
//!
//! Each joined channel runs as its own task with two mailboxes: a control
//! mailbox fed by the multiplexer (inbound messages, info terms, the close
//! command) and a broadcast mailbox fed by the pub/sub bus. The worker owns
//! the channel instance and its [`Socket`] clone; nothing else touches them.
//!
//! Crash isolation: every callback invocation runs under `catch_unwind`. A
//! panic becomes `ExitReason::Error`, `terminate` still runs, and the
//! multiplexer hears about the death through its event mailbox instead of
//! unwinding with us.

use crate::channel::{ChannelFactory, HandleResult, Hint, Info, RunningChannel};
use crate::core::{ExitReason, Term, WorkerId};
use crate::message::{Broadcast, Message, Outbound, Reply, ReplyStatus, EVENT_LEAVE};
use crate::mux::SocketEvent;
use crate::pubsub::{Fastlane, Subscriber};
use crate::registry::ChannelOpts;
use crate::socket::Socket;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Control messages delivered to a worker.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// A decoded client frame for this worker's topic.
    Inbound(Message),
    /// An out-of-band term for `handle_info`.
    Info(Term),
    /// Stop with reason `shutdown:closed`.
    Close,
}

/// How the mux reaches a worker it owns.
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) control: mpsc::UnboundedSender<WorkerMessage>,
    pub(crate) task: JoinHandle<()>,
}

impl WorkerHandle {
    /// A clonable reference usable from outside the connection.
    pub(crate) fn channel_ref(&self) -> ChannelRef {
        ChannelRef {
            id: self.id,
            control: self.control.clone(),
        }
    }
}

/// Clonable handle to a running channel worker.
///
/// Lets timers and other tasks deliver terms to the channel's
/// `handle_info` without going through the connection.
#[derive(Clone)]
pub struct ChannelRef {
    id: WorkerId,
    control: mpsc::UnboundedSender<WorkerMessage>,
}

impl ChannelRef {
    /// The worker's identity.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Deliver a term to the channel's `handle_info`.
    ///
    /// Returns `false` when the worker is gone.
    pub fn send_info(&self, term: Term) -> bool {
        self.control.send(WorkerMessage::Info(term)).is_ok()
    }
}

/// What the join protocol reported back to the multiplexer.
#[derive(Debug)]
pub(crate) enum JoinOutcome {
    /// Joined; carries the reply payload.
    Ok(Value),
    /// Refused by the join callback; carries the refusal payload.
    Refused(Value),
    /// The join callback panicked or the worker failed to start.
    Crashed(String),
}

/// Everything a worker needs to run the join protocol.
pub(crate) struct JoinRequest {
    pub(crate) factory: Arc<dyn ChannelFactory>,
    pub(crate) opts: ChannelOpts,
    pub(crate) topic: String,
    pub(crate) join_ref: Option<String>,
    pub(crate) payload: Value,
    /// Connection-level socket; the worker stamps its own clone.
    pub(crate) socket: Socket,
    pub(crate) events: mpsc::UnboundedSender<SocketEvent>,
}

/// Spawn a worker and run the join protocol.
///
/// The caller awaits the outcome receiver; a dropped receiver means the
/// worker died before reporting and counts as a crash.
pub(crate) fn spawn(req: JoinRequest) -> (WorkerHandle, oneshot::Receiver<JoinOutcome>) {
    let id = WorkerId::next();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let task = tokio::spawn(worker_main(id, req, control_rx, outcome_tx));

    (
        WorkerHandle {
            id,
            control: control_tx,
            task,
        },
        outcome_rx,
    )
}

/// Force-close workers: send `close`, wait for death, kill on timeout.
///
/// Returns only when every targeted worker is dead.
pub(crate) async fn close_channels(handles: Vec<WorkerHandle>, timeout: Duration) {
    for handle in &handles {
        let _ = handle.control.send(WorkerMessage::Close);
    }

    futures::future::join_all(handles.into_iter().map(|handle| async move {
        let WorkerHandle { id, mut task, .. } = handle;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            tracing::warn!(worker = %id, "channel ignored close; killing");
            task.abort();
            let _ = task.await;
        }
    }))
    .await;
}

// ============================================================================
// Worker internals
// ============================================================================

async fn worker_main(
    id: WorkerId,
    req: JoinRequest,
    control_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    outcome_tx: oneshot::Sender<JoinOutcome>,
) {
    let JoinRequest {
        factory,
        opts,
        topic,
        join_ref,
        payload,
        mut socket,
        events,
    } = req;

    socket.topic = topic.clone();
    socket.join_ref = join_ref;
    socket.channel = Some(factory.channel_name());
    socket.channel_id = Some(id);
    socket.private = factory.private();
    socket.assigns.extend(opts.assigns);

    let join = AssertUnwindSafe(factory.join(&topic, payload, &mut socket))
        .catch_unwind()
        .await;

    let (mut instance, reply) = match join {
        Err(panic) => {
            let _ = outcome_tx.send(JoinOutcome::Crashed(panic_message(panic)));
            return;
        }
        Ok(Err(refusal)) => {
            let _ = outcome_tx.send(JoinOutcome::Refused(refusal));
            return;
        }
        Ok(Ok(pair)) => pair,
    };

    let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
    let fastlane = socket.transport_tx.clone().map(|sink| Fastlane {
        sink,
        serializer: socket.serializer().clone(),
        intercepts: factory
            .intercepts()
            .iter()
            .map(|event| event.to_string())
            .collect(),
    });
    socket.bus().subscribe(
        &topic,
        Subscriber {
            id,
            broadcasts: broadcast_tx,
            fastlane,
        },
    );
    socket.joined = true;

    tracing::debug!(worker = %id, topic = %topic, channel = factory.channel_name(), "channel joined");
    let _ = outcome_tx.send(JoinOutcome::Ok(reply));

    let exit = run_loop(&mut *instance, &mut socket, control_rx, broadcast_rx).await;

    let reason = exit.reason();
    if AssertUnwindSafe(instance.terminate(&reason, &mut socket))
        .catch_unwind()
        .await
        .is_err()
    {
        tracing::error!(worker = %id, topic = %topic, "terminate callback panicked");
    }

    socket.bus().unsubscribe(&topic, id);
    tracing::debug!(worker = %id, topic = %topic, reason = %reason, "channel stopped");

    match exit {
        // The transport is gone; there is nobody left to notify.
        Exit::TransportDown => {}
        Exit::Stopped { reason, final_reply } => {
            if reason.is_normal() {
                let _ = events.send(SocketEvent::GracefulExit {
                    worker: id,
                    frame: final_reply.map(Outbound::Reply),
                });
            } else {
                let _ = events.send(SocketEvent::ChannelExit { worker: id, reason });
            }
        }
    }
}

enum Exit {
    Stopped {
        reason: ExitReason,
        final_reply: Option<Reply>,
    },
    TransportDown,
}

impl Exit {
    fn reason(&self) -> ExitReason {
        match self {
            Exit::Stopped { reason, .. } => reason.clone(),
            Exit::TransportDown => ExitReason::closed(),
        }
    }
}

enum Flow {
    Continue(Option<Hint>),
    Exit {
        reason: ExitReason,
        final_reply: Option<Reply>,
    },
}

enum Incoming {
    Control(WorkerMessage),
    Broadcast(Broadcast),
    IdleTimeout,
    TransportDown,
}

async fn run_loop(
    instance: &mut dyn RunningChannel,
    socket: &mut Socket,
    mut control_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    mut broadcast_rx: mpsc::UnboundedReceiver<Broadcast>,
) -> Exit {
    let transport = socket.transport_tx.clone();
    let mut broadcasts_open = true;
    let mut idle: Option<Duration> = None;

    loop {
        let transport_closed = async {
            match &transport {
                Some(tx) => tx.closed().await,
                None => futures::future::pending().await,
            }
        };

        let incoming = tokio::select! {
            biased;

            maybe = control_rx.recv() => match maybe {
                Some(msg) => Incoming::Control(msg),
                // The multiplexer dropped us; same as a close command.
                None => Incoming::Control(WorkerMessage::Close),
            },

            maybe = broadcast_rx.recv(), if broadcasts_open => match maybe {
                Some(broadcast) => Incoming::Broadcast(broadcast),
                None => {
                    broadcasts_open = false;
                    continue;
                }
            },

            _ = transport_closed => Incoming::TransportDown,

            _ = tokio::time::sleep(idle.unwrap_or(Duration::ZERO)), if idle.is_some() => {
                Incoming::IdleTimeout
            }
        };

        let flow = match incoming {
            Incoming::TransportDown => return Exit::TransportDown,
            Incoming::Control(WorkerMessage::Close) => Flow::Exit {
                reason: ExitReason::closed(),
                final_reply: None,
            },
            Incoming::Control(WorkerMessage::Inbound(msg)) => {
                guarded(handle_inbound(instance, socket, msg)).await
            }
            Incoming::Control(WorkerMessage::Info(term)) => {
                guarded(handle_info(instance, socket, Info::User(term))).await
            }
            Incoming::Broadcast(broadcast) => {
                guarded(handle_broadcast(instance, socket, broadcast)).await
            }
            Incoming::IdleTimeout => guarded(handle_info(instance, socket, Info::Timeout)).await,
        };

        match flow {
            Flow::Continue(hint) => {
                idle = None;
                match hint {
                    Some(Hint::Timeout(duration)) => idle = Some(duration),
                    Some(Hint::Hibernate) => {
                        socket.assigns.shrink_to_fit();
                        socket.private.shrink_to_fit();
                    }
                    None => {}
                }
            }
            Flow::Exit { reason, final_reply } => {
                return Exit::Stopped { reason, final_reply };
            }
        }
    }
}

/// Run a dispatch future, converting a panic into an abnormal exit.
async fn guarded(dispatch: impl std::future::Future<Output = Flow>) -> Flow {
    match AssertUnwindSafe(dispatch).catch_unwind().await {
        Ok(flow) => flow,
        Err(panic) => Flow::Exit {
            reason: ExitReason::Error(panic_message(panic)),
            final_reply: None,
        },
    }
}

async fn handle_inbound(
    instance: &mut dyn RunningChannel,
    socket: &mut Socket,
    msg: Message,
) -> Flow {
    if msg.event == EVENT_LEAVE {
        let reply = Reply::ok(
            socket.join_ref.clone(),
            msg.msg_ref,
            socket.topic.clone(),
            Value::Object(Default::default()),
        );
        return Flow::Exit {
            reason: ExitReason::left(),
            final_reply: Some(reply),
        };
    }

    socket.msg_ref = msg.msg_ref;
    let result = instance.handle_in(&msg.event, msg.payload, socket).await;
    let flow = apply_result(result, socket, "handle_in");
    socket.msg_ref = None;
    flow
}

async fn handle_broadcast(
    instance: &mut dyn RunningChannel,
    socket: &mut Socket,
    broadcast: Broadcast,
) -> Flow {
    let result = instance
        .handle_out(&broadcast.event, broadcast.payload, socket)
        .await;
    apply_result(result, socket, "handle_out")
}

async fn handle_info(instance: &mut dyn RunningChannel, socket: &mut Socket, info: Info) -> Flow {
    let result = instance.handle_info(info, socket).await;
    apply_result(result, socket, "handle_info")
}

fn apply_result(result: HandleResult, socket: &mut Socket, callback: &str) -> Flow {
    match result {
        HandleResult::NoReply => Flow::Continue(None),
        HandleResult::NoReplyHint(hint) => Flow::Continue(Some(hint)),
        HandleResult::Reply(status, payload) => {
            let reply = build_reply(socket, callback, status, payload);
            emit_reply(socket, reply);
            Flow::Continue(None)
        }
        HandleResult::Stop(reason) => Flow::Exit {
            reason,
            final_reply: None,
        },
        HandleResult::StopReply(reason, status, payload) => {
            let reply = build_reply(socket, callback, status, payload);
            if reason.is_normal() {
                // Carried in the graceful-exit notification so the
                // multiplexer emits it after removing the channel.
                Flow::Exit {
                    reason,
                    final_reply: Some(reply),
                }
            } else {
                emit_reply(socket, reply);
                Flow::Exit {
                    reason,
                    final_reply: None,
                }
            }
        }
    }
}

/// Build a reply for the pending inbound ref.
///
/// Panics when called from the wrong callback or without a pending ref;
/// the panic message enumerates the accepted result shapes.
fn build_reply(socket: &Socket, callback: &str, status: ReplyStatus, payload: Value) -> Reply {
    if callback != "handle_in" {
        panic!(
            "replies are only valid from handle_in; accepted results from {} are \
             NoReply, NoReplyHint(hint), and Stop(reason)",
            callback
        );
    }
    if socket.msg_ref.is_none() {
        panic!(
            "reply without a pending inbound ref; accepted results are NoReply, \
             NoReplyHint(hint), Reply(status, payload), Stop(reason), and \
             StopReply(reason, status, payload), and replies require the message \
             being handled to carry a ref"
        );
    }

    Reply {
        join_ref: socket.join_ref.clone(),
        msg_ref: socket.msg_ref.clone(),
        topic: socket.topic.clone(),
        status,
        payload,
    }
}

/// Encode and send a reply on the worker's own lane.
///
/// Encode failure is a worker crash on that message.
fn emit_reply(socket: &Socket, reply: Reply) {
    let frame = socket
        .serializer
        .encode(&Outbound::Reply(reply))
        .unwrap_or_else(|e| panic!("failed to encode reply: {}", e))
        .into_frame();
    if let Some(transport) = &socket.transport_tx {
        let _ = transport.send(frame);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "channel panicked".to_string()
    }
}
