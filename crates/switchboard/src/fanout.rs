//! Broadcast fan-out with the fastlane optimization.
//!
//! Given the subscriber list for a topic and one broadcast, the dispatcher
//! delivers to each subscriber exactly once:
//!
//! - subscribers without a fastlane hint get the raw broadcast in their
//!   mailbox (their channel worker runs `handle_out`);
//! - subscribers intercepting the broadcast's event also get the raw
//!   broadcast, so `handle_out` can rewrite or suppress it;
//! - everyone else gets the frame produced by their serializer's `fastlane`
//!   entry point, sent straight to the transport.
//!
//! Encoded frames are cached per serializer for the duration of one call, so
//! N subscribers sharing a codec cost a single encode. The cache is a local
//! map and never outlives the call.
//!
//! Ordering: fastlane frames and a worker's own `handle_out` output travel
//! different lanes; no relative order is guaranteed between them for
//! different events on the same topic.

use crate::core::WorkerId;
use crate::message::Broadcast;
use crate::pubsub::Subscriber;
use crate::serializer::{Frame, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// Cache key: one entry per distinct serializer instance.
fn serializer_key(serializer: &Arc<dyn Serializer>) -> usize {
    Arc::as_ptr(serializer) as *const () as usize
}

/// Deliver `broadcast` to `subscribers`, skipping the publisher `from`.
///
/// Returns the ids of subscribers whose mailbox or transport is gone, so the
/// bus can prune them.
pub fn dispatch(
    subscribers: &[Subscriber],
    from: Option<WorkerId>,
    broadcast: &Broadcast,
) -> Vec<WorkerId> {
    let mut cache: HashMap<usize, Option<Frame>> = HashMap::new();
    let mut dead = Vec::new();

    for subscriber in subscribers {
        if Some(subscriber.id) == from {
            continue;
        }

        let lane = match &subscriber.fastlane {
            None => None,
            Some(lane) if lane.intercepts.contains(&broadcast.event) => None,
            Some(lane) => Some(lane),
        };

        match lane {
            None => {
                if subscriber.broadcasts.send(broadcast.clone()).is_err() {
                    dead.push(subscriber.id);
                }
            }
            Some(lane) => {
                let frame = cache
                    .entry(serializer_key(&lane.serializer))
                    .or_insert_with(|| match lane.serializer.fastlane(broadcast) {
                        Ok(encoded) => Some(encoded.into_frame()),
                        Err(e) => {
                            tracing::error!(
                                topic = %broadcast.topic,
                                event = %broadcast.event,
                                serializer = lane.serializer.name(),
                                error = %e,
                                "fastlane encode failed; dropping deliveries for this serializer"
                            );
                            None
                        }
                    });
                if let Some(frame) = frame {
                    if lane.sink.send(frame.clone()).is_err() {
                        dead.push(subscriber.id);
                    }
                }
            }
        }
    }

    dead
}
