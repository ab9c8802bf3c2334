//! MessagePack binary codec.
//!
//! Frames are MessagePack-encoded envelopes tagged with their record kind.
//! Payload values survive the trip because MessagePack is self-describing.

use super::{Encoded, Frame, Opcode, SerializeError, Serializer};
use crate::message::{Broadcast, Message, Outbound, Reply, ReplyStatus};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum accepted frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire envelope for the binary codec.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Message {
        join_ref: Option<String>,
        #[serde(rename = "ref")]
        msg_ref: Option<String>,
        topic: String,
        event: String,
        payload: Value,
    },
    Reply {
        join_ref: Option<String>,
        #[serde(rename = "ref")]
        msg_ref: Option<String>,
        topic: String,
        status: ReplyStatus,
        payload: Value,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },
}

/// The MessagePack codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySerializer;

impl BinarySerializer {
    /// Create the codec.
    pub fn new() -> Self {
        BinarySerializer
    }

    fn frame(envelope: &Envelope) -> Result<Encoded, SerializeError> {
        let bytes =
            rmp_serde::to_vec_named(envelope).map_err(|e| SerializeError::Encode(e.to_string()))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(SerializeError::Encode(format!(
                "frame size {} exceeds maximum {}",
                bytes.len(),
                MAX_FRAME_SIZE
            )));
        }
        Ok(Encoded::Frame(Frame {
            opcode: Opcode::Binary,
            bytes: Bytes::from(bytes),
        }))
    }
}

impl Serializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn decode(&self, frame: Frame) -> Result<Message, SerializeError> {
        if frame.opcode != Opcode::Binary {
            return Err(SerializeError::UnsupportedOpcode(frame.opcode));
        }
        if frame.bytes.len() > MAX_FRAME_SIZE {
            return Err(SerializeError::Decode(format!(
                "frame size {} exceeds maximum {}",
                frame.bytes.len(),
                MAX_FRAME_SIZE
            )));
        }

        let envelope: Envelope = rmp_serde::from_slice(&frame.bytes)
            .map_err(|e| SerializeError::Decode(e.to_string()))?;
        match envelope {
            Envelope::Message {
                join_ref,
                msg_ref,
                topic,
                event,
                payload,
            } => Ok(Message {
                join_ref,
                msg_ref,
                topic,
                event,
                payload,
            }),
            Envelope::Reply { .. } | Envelope::Broadcast { .. } => Err(SerializeError::Decode(
                "client frames must be message records".into(),
            )),
        }
    }

    fn encode(&self, out: &Outbound) -> Result<Encoded, SerializeError> {
        let envelope = match out {
            Outbound::Message(Message {
                join_ref,
                msg_ref,
                topic,
                event,
                payload,
            }) => Envelope::Message {
                join_ref: join_ref.clone(),
                msg_ref: msg_ref.clone(),
                topic: topic.clone(),
                event: event.clone(),
                payload: payload.clone(),
            },
            Outbound::Reply(Reply {
                join_ref,
                msg_ref,
                topic,
                status,
                payload,
            }) => Envelope::Reply {
                join_ref: join_ref.clone(),
                msg_ref: msg_ref.clone(),
                topic: topic.clone(),
                status: *status,
                payload: payload.clone(),
            },
            Outbound::Broadcast(b) => Envelope::Broadcast {
                topic: b.topic.clone(),
                event: b.event.clone(),
                payload: b.payload.clone(),
            },
        };
        Self::frame(&envelope)
    }

    fn fastlane(&self, broadcast: &Broadcast) -> Result<Encoded, SerializeError> {
        Self::frame(&Envelope::Broadcast {
            topic: broadcast.topic.clone(),
            event: broadcast.event.clone(),
            payload: broadcast.payload.clone(),
        })
    }
}
