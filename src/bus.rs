//! The Incident Bus: an in-process publish/subscribe fan-out over a bounded
//! ring buffer (capacity 100), so a freshly attached subscriber can hydrate
//! from recent history before receiving only-new events.
//!
//! Grounded on the broadcast-channel event bus pattern used for in-process
//! domain event fan-out elsewhere in the retrieval pack, and on
//! `StreamingSink`, which wraps the same `tokio::sync::broadcast` primitive
//! for telemetry fan-out with drop tracking.

use crate::model::BusEvent;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// A live subscription handle. Replays recent history first (already drained
/// into the channel by `subscribe`), then yields newly published events.
pub struct Subscription {
    receiver: broadcast::Receiver<BusEvent>,
}

impl Subscription {
    /// Await the next event. Returns `None` once the bus itself is dropped.
    /// A subscriber that falls behind the ring skips ahead rather than
    /// blocking publishers — it never observes publish order violations,
    /// only gaps.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process pub/sub with a bounded replay ring (§4.3).
pub struct IncidentBus {
    sender: broadcast::Sender<BusEvent>,
    ring: Mutex<VecDeque<BusEvent>>,
    ring_capacity: usize,
    hydration_count: usize,
}

impl IncidentBus {
    pub fn new(ring_capacity: usize, hydration_count: usize) -> Self {
        let (sender, _) = broadcast::channel(ring_capacity.max(1));
        Self {
            sender,
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            hydration_count,
        }
    }

    /// Publish an event: append to the ring (dropping the oldest entry once
    /// full) and deliver to every current subscriber. Non-blocking — a slow
    /// or absent subscriber cannot stall the publisher; `broadcast::Sender`
    /// only fails when there are zero receivers, which this treats as a no-op.
    pub fn publish(&self, event: BusEvent) {
        {
            let mut ring = self.ring.lock().expect("incident bus ring poisoned");
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        let _ = self.sender.send(event);
    }

    /// Subscribe for live events. The returned handle has already been primed
    /// with up to `hydration_count` of the most recent buffered events so a
    /// fresh consumer sees recent context immediately.
    pub fn subscribe(&self) -> (Vec<BusEvent>, Subscription) {
        let receiver = self.sender.subscribe();
        let backfill = {
            let ring = self.ring.lock().expect("incident bus ring poisoned");
            let skip = ring.len().saturating_sub(self.hydration_count);
            ring.iter().skip(skip).cloned().collect()
        };
        (backfill, Subscription { receiver })
    }

    /// Snapshot copy of the ring, for diagnostic reads.
    pub fn recent_events(&self) -> Vec<BusEvent> {
        self.ring.lock().expect("incident bus ring poisoned").iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
