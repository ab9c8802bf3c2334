//! The pub/sub bus boundary.
//!
//! The bus is the only cross-connection shared resource. The multiplexer and
//! channel workers talk to it through the [`PubSub`] trait; [`LocalBus`] is
//! the in-process implementation used by tests and single-node deployments.
//!
//! Each subscription carries an optional [`Fastlane`] hint. When present,
//! broadcasts for events the subscriber does not intercept are encoded once
//! per serializer and sent straight to the transport, skipping the channel
//! worker entirely; intercepted events are delivered raw so the worker's
//! `handle_out` can rewrite them.

use crate::core::{TransportSender, WorkerId};
use crate::fanout;
use crate::message::Broadcast;
use crate::serializer::Serializer;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Fastlane hint attached to a subscription.
#[derive(Clone)]
pub struct Fastlane {
    /// Direct handle to the subscriber's transport.
    pub sink: TransportSender,
    /// Codec used to encode fastlane frames.
    pub serializer: Arc<dyn Serializer>,
    /// Events the subscriber intercepts; these bypass the fastlane.
    pub intercepts: HashSet<String>,
}

/// A topic subscription.
#[derive(Clone)]
pub struct Subscriber {
    /// Identity of the subscribing worker.
    pub id: WorkerId,
    /// Mailbox receiving raw broadcasts.
    pub broadcasts: mpsc::UnboundedSender<Broadcast>,
    /// Optional fastlane hint.
    pub fastlane: Option<Fastlane>,
}

/// Errors surfaced by a bus implementation.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The bus rejected or failed to route a publish.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Topic-based publish/subscribe with per-subscriber fastlane hints.
pub trait PubSub: Send + Sync + 'static {
    /// Subscribe a worker to a topic.
    fn subscribe(&self, topic: &str, subscriber: Subscriber);

    /// Drop a worker's subscription to a topic.
    fn unsubscribe(&self, topic: &str, id: WorkerId);

    /// Publish a broadcast to every subscriber of its topic.
    ///
    /// `from` is the publisher's own worker id; that subscriber is skipped.
    fn publish(&self, from: Option<WorkerId>, broadcast: Broadcast) -> Result<(), PubSubError>;
}

/// In-process bus.
///
/// Subscriptions live in a topic-keyed map; publishing snapshots the
/// subscriber list and hands it to the fan-out dispatcher. Subscribers whose
/// mailboxes are gone are pruned on the next publish.
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl LocalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        LocalBus::default()
    }

    /// Number of live subscriptions for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }
}

impl PubSub for LocalBus {
    fn subscribe(&self, topic: &str, subscriber: Subscriber) {
        tracing::debug!(topic = %topic, worker = %subscriber.id, "subscribed");
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);
    }

    fn unsubscribe(&self, topic: &str, id: WorkerId) {
        let mut topics = self.topics.write();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
            tracing::debug!(topic = %topic, worker = %id, "unsubscribed");
        }
    }

    fn publish(&self, from: Option<WorkerId>, broadcast: Broadcast) -> Result<(), PubSubError> {
        let subscribers = match self.topics.read().get(&broadcast.topic) {
            Some(subscribers) => subscribers.clone(),
            None => return Ok(()),
        };

        let dead = fanout::dispatch(&subscribers, from, &broadcast);
        if !dead.is_empty() {
            let mut topics = self.topics.write();
            if let Some(subscribers) = topics.get_mut(&broadcast.topic) {
                subscribers.retain(|s| !dead.contains(&s.id));
                if subscribers.is_empty() {
                    topics.remove(&broadcast.topic);
                }
            }
        }
        Ok(())
    }
}
