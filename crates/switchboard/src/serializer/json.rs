//! JSON array codec.
//!
//! Frames are JSON arrays: `[join_ref, ref, topic, event, payload]`. Replies
//! travel as a `phx_reply` event whose payload wraps the status and the
//! reply body:
//!
//! ```text
//! ["7", "8", "room:42", "phx_reply", {"status": "ok", "payload": {...}}]
//! ```

use super::{Encoded, Frame, Opcode, SerializeError, Serializer};
use crate::message::{Broadcast, Message, Outbound, Reply, EVENT_REPLY};
use bytes::Bytes;
use serde_json::{json, Value};

/// The JSON array codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Create the codec.
    pub fn new() -> Self {
        JsonSerializer
    }

    fn frame(value: Value) -> Result<Encoded, SerializeError> {
        let bytes = serde_json::to_vec(&value).map_err(|e| SerializeError::Encode(e.to_string()))?;
        Ok(Encoded::Frame(Frame {
            opcode: Opcode::Text,
            bytes: Bytes::from(bytes),
        }))
    }

    fn encode_reply(reply: &Reply) -> Result<Encoded, SerializeError> {
        Self::frame(json!([
            reply.join_ref,
            reply.msg_ref,
            reply.topic,
            EVENT_REPLY,
            { "status": reply.status.as_str(), "payload": reply.payload },
        ]))
    }

    fn encode_message(msg: &Message) -> Result<Encoded, SerializeError> {
        Self::frame(json!([
            msg.join_ref,
            msg.msg_ref,
            msg.topic,
            msg.event,
            msg.payload,
        ]))
    }

    fn encode_broadcast(broadcast: &Broadcast) -> Result<Encoded, SerializeError> {
        Self::frame(json!([
            Value::Null,
            Value::Null,
            broadcast.topic,
            broadcast.event,
            broadcast.payload,
        ]))
    }
}

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, frame: Frame) -> Result<Message, SerializeError> {
        if frame.opcode != Opcode::Text {
            return Err(SerializeError::UnsupportedOpcode(frame.opcode));
        }

        let value: Value = serde_json::from_slice(&frame.bytes)
            .map_err(|e| SerializeError::Decode(e.to_string()))?;
        let parts = value
            .as_array()
            .filter(|a| a.len() == 5)
            .ok_or_else(|| SerializeError::Decode("expected a 5-element array".into()))?;

        let as_ref = |v: &Value| -> Result<Option<String>, SerializeError> {
            match v {
                Value::Null => Ok(None),
                Value::String(s) => Ok(Some(s.clone())),
                other => Err(SerializeError::Decode(format!("bad ref: {}", other))),
            }
        };
        let as_str = |v: &Value, field: &str| -> Result<String, SerializeError> {
            v.as_str()
                .map(String::from)
                .ok_or_else(|| SerializeError::Decode(format!("{} is not a string", field)))
        };

        Ok(Message {
            join_ref: as_ref(&parts[0])?,
            msg_ref: as_ref(&parts[1])?,
            topic: as_str(&parts[2], "topic")?,
            event: as_str(&parts[3], "event")?,
            payload: parts[4].clone(),
        })
    }

    fn encode(&self, out: &Outbound) -> Result<Encoded, SerializeError> {
        match out {
            Outbound::Message(msg) => Self::encode_message(msg),
            Outbound::Reply(reply) => Self::encode_reply(reply),
            Outbound::Broadcast(broadcast) => Self::encode_broadcast(broadcast),
        }
    }

    fn fastlane(&self, broadcast: &Broadcast) -> Result<Encoded, SerializeError> {
        Self::encode_broadcast(broadcast)
    }
}
