//! Core types shared across the crate: worker identity, exit reasons, and
//! opaque terms for out-of-band messages.

use crate::serializer::Frame;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Handle to the connection-owner task: encoded frames sent here are written
/// to the wire in send order.
pub type TransportSender = mpsc::UnboundedSender<Frame>;

/// Identity of a spawned worker task (a channel worker or the connection
/// task itself).
///
/// Ids are unique within the process and never reused. They are what the
/// pub/sub bus and the multiplexer's inverse map key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        WorkerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What ended a channel worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean exit.
    Normal,
    /// Deliberate shutdown, optionally tagged with its cause.
    Shutdown(Option<ShutdownCause>),
    /// Abnormal exit carrying a diagnostic.
    Error(String),
    /// Forcibly killed after the close timeout.
    Kill,
}

/// Cause attached to a deliberate shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The client left the topic (`phx_leave`).
    Left,
    /// The connection or the multiplexer closed the channel.
    Closed,
}

impl ExitReason {
    /// Shutdown with the `left` cause.
    pub fn left() -> Self {
        ExitReason::Shutdown(Some(ShutdownCause::Left))
    }

    /// Shutdown with the `closed` cause.
    pub fn closed() -> Self {
        ExitReason::Shutdown(Some(ShutdownCause::Closed))
    }

    /// Whether this reason counts as a normal shutdown.
    ///
    /// Normal shutdowns produce a graceful-exit notification; anything else
    /// goes through the death watch and surfaces as `phx_error`.
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal | ExitReason::Shutdown(_))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Shutdown(None) => write!(f, "shutdown"),
            ExitReason::Shutdown(Some(ShutdownCause::Left)) => write!(f, "shutdown:left"),
            ExitReason::Shutdown(Some(ShutdownCause::Closed)) => write!(f, "shutdown:closed"),
            ExitReason::Error(e) => write!(f, "error: {}", e),
            ExitReason::Kill => write!(f, "killed"),
        }
    }
}

/// An opaque, self-describing value sent to a channel's `handle_info`.
///
/// Terms are MessagePack-encoded so senders do not need to know the channel's
/// concrete types; the receiving callback decodes into whatever it expects.
#[derive(Debug, Clone)]
pub struct Term(Bytes);

impl Term {
    /// Encode a value into a term.
    pub fn encode<T: Serialize>(value: &T) -> Self {
        let bytes = rmp_serde::to_vec_named(value).expect("failed to encode term");
        Term(Bytes::from(bytes))
    }

    /// Try to decode the term as `T`. Returns `None` on any mismatch.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        rmp_serde::from_slice(&self.0).ok()
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Term {
    fn from(bytes: Bytes) -> Self {
        Term(bytes)
    }
}
