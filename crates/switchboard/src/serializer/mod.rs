//! The codec boundary between the multiplexer and the transport.
//!
//! A [`Serializer`] turns wire frames into [`Message`] records and outbound
//! records back into frames. Serializers are plug-ins: the multiplexer and
//! the fan-out dispatcher call them at the boundary and never inspect frame
//! bytes themselves.
//!
//! Two codecs ship with the crate:
//!
//! - [`JsonSerializer`](json::JsonSerializer) — the JSON array protocol
//!   (`[join_ref, ref, topic, event, payload]`).
//! - [`BinarySerializer`](binary::BinarySerializer) — MessagePack frames for
//!   bandwidth-sensitive clients.
//!
//! Transports declare which codecs they accept through a [`SerializerSpec`],
//! matching the client-requested protocol version against semver
//! requirements.

pub mod binary;
pub mod json;

use crate::message::{Broadcast, Message, Outbound};
use bytes::Bytes;
use semver::{Version, VersionReq};
use std::sync::Arc;
use thiserror::Error;

/// Frame kind on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Text frame (UTF-8 payload).
    Text,
    /// Binary frame.
    Binary,
}

/// An opaque transport frame: opcode plus payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame kind.
    pub opcode: Opcode,
    /// Payload bytes.
    pub bytes: Bytes,
}

impl Frame {
    /// A text frame.
    pub fn text(bytes: impl Into<Bytes>) -> Self {
        Frame {
            opcode: Opcode::Text,
            bytes: bytes.into(),
        }
    }

    /// A binary frame.
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Frame {
            opcode: Opcode::Binary,
            bytes: bytes.into(),
        }
    }
}

/// An encoded outbound frame as returned by a serializer.
///
/// The modern shape is [`Encoded::Frame`]. Serializers written against the
/// old API returned a tagged triple instead; that shape is still accepted
/// and normalized by [`Encoded::into_frame`].
#[derive(Debug, Clone)]
pub enum Encoded {
    /// Opcode plus bytes.
    Frame(Frame),
    /// Legacy tagged shape, equivalent to [`Encoded::Frame`].
    SocketPush {
        /// Frame kind.
        opcode: Opcode,
        /// Payload bytes.
        bytes: Bytes,
    },
}

impl Encoded {
    /// Normalize either return shape into a [`Frame`].
    pub fn into_frame(self) -> Frame {
        match self {
            Encoded::Frame(frame) => frame,
            Encoded::SocketPush { opcode, bytes } => Frame { opcode, bytes },
        }
    }
}

/// Errors crossing the codec boundary.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// The inbound frame could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The outbound record could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
    /// The frame's opcode is not supported by this serializer.
    #[error("unsupported {0:?} frame")]
    UnsupportedOpcode(Opcode),
}

/// A wire codec.
///
/// `encode` and `fastlane` are distinct entry points: `fastlane` encodes a
/// raw [`Broadcast`] envelope for direct delivery to the transport, bypassing
/// any channel worker.
pub trait Serializer: Send + Sync + 'static {
    /// Codec name, used in log lines and negotiation diagnostics.
    fn name(&self) -> &'static str;

    /// Decode an inbound frame into a [`Message`].
    fn decode(&self, frame: Frame) -> Result<Message, SerializeError>;

    /// Encode a server-originated record.
    fn encode(&self, out: &Outbound) -> Result<Encoded, SerializeError>;

    /// Encode a broadcast for fastlane delivery.
    fn fastlane(&self, broadcast: &Broadcast) -> Result<Encoded, SerializeError>;
}

/// Version-negotiated serializer configuration for one transport.
///
/// Entries are `(codec, requirement)` pairs; [`SerializerSpec::negotiate`]
/// resolves the first entry whose requirement matches the client-requested
/// protocol version. A bare codec without a requirement is the legacy
/// configuration shape and is accepted with a deprecation warning.
#[derive(Clone, Default)]
pub struct SerializerSpec {
    entries: Vec<(Arc<dyn Serializer>, VersionReq)>,
}

impl SerializerSpec {
    /// An empty spec; add codecs with [`SerializerSpec::with`].
    pub fn new() -> Self {
        SerializerSpec::default()
    }

    /// Add a codec served for versions matching `requirement`.
    ///
    /// # Panics
    ///
    /// Panics when the requirement string does not parse, so a bad
    /// configuration fails at registration time.
    pub fn with(mut self, serializer: impl Serializer, requirement: &str) -> Self {
        let parsed = VersionReq::parse(requirement).unwrap_or_else(|e| {
            panic!(
                "invalid version requirement {:?} for serializer {}: {}",
                requirement,
                serializer.name(),
                e
            )
        });
        self.entries.push((Arc::new(serializer), parsed));
        self
    }

    /// Legacy configuration: a single codec accepted for every version.
    ///
    /// Kept for one release window; emits a deprecation warning.
    pub fn legacy(serializer: impl Serializer) -> Self {
        tracing::warn!(
            serializer = serializer.name(),
            "bare serializer configuration is deprecated; \
             use (serializer, version requirement) pairs"
        );
        SerializerSpec {
            entries: vec![(Arc::new(serializer), VersionReq::STAR)],
        }
    }

    /// Resolve the codec for a client-requested protocol version.
    ///
    /// Returns `None` when the version does not parse or no entry matches.
    pub fn negotiate(&self, vsn: &str) -> Option<Arc<dyn Serializer>> {
        let version = Version::parse(vsn).ok()?;
        self.entries
            .iter()
            .find(|(_, req)| req.matches(&version))
            .map(|(serializer, _)| serializer.clone())
    }
}
