//! Real-time fan-out of tag updates to live subscribers.
//!
//! Each subscriber owns a bounded channel. `publish` walks the subscriber
//! set with `try_send`: a full channel drops that one event for that one
//! subscriber, a disconnected channel marks the subscriber for removal.
//! Removal candidates are collected during iteration and pruned afterwards,
//! so the set is never mutated while it is being traversed. Delivery to one
//! subscriber preserves publish order; no ordering holds across subscribers.

use fieldgate_core::TagUpdate;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::metrics::EngineMetrics;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct Subscriber {
    id: Uuid,
    tx: flume::Sender<TagUpdate>,
}

/// A live subscription. Dropping the receiver disconnects the channel and
/// the subscriber is pruned on the next publish.
pub struct Subscription {
    pub id: Uuid,
    pub rx: flume::Receiver<TagUpdate>,
}

pub struct Broadcaster {
    subscribers: RwLock<Vec<Subscriber>>,
    channel_capacity: usize,
    metrics: Arc<EngineMetrics>,
}

impl Broadcaster {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY, metrics)
    }

    pub fn with_capacity(channel_capacity: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            channel_capacity,
            metrics,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = flume::bounded(self.channel_capacity);
        let id = Uuid::new_v4();
        self.subscribers.write().push(Subscriber { id, tx });
        debug!(subscriber_id = %id, "Subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.write().retain(|s| s.id != id);
        debug!(subscriber_id = %id, "Subscriber removed");
    }

    /// Delivers the event to every live subscriber. Never blocks and never
    /// fails: broken subscribers are pruned, full ones lose this event.
    pub fn publish(&self, event: &TagUpdate) {
        let mut dead: Vec<Uuid> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(_)) => {
                        self.metrics.record_broadcast_drop();
                    }
                    Err(flume::TrySendError::Disconnected(_)) => {
                        dead.push(subscriber.id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|s| !dead.contains(&s.id));
            debug!(removed = dead.len(), "Pruned disconnected subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drops every subscriber, closing their channels.
    pub fn close_all(&self) {
        self.subscribers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::{DataType, Quality, Tag, TagValue};

    fn update(seq: i64) -> TagUpdate {
        TagUpdate {
            device_id: "d1".to_string(),
            tag: Tag {
                name: "counter".to_string(),
                address: "40001".to_string(),
                data_type: DataType::Int,
                writable: false,
                unit: None,
                description: None,
                value: Some(TagValue::Int(seq)),
                quality: Quality::Good,
                updated_at: None,
            },
        }
    }

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Arc::new(EngineMetrics::default()))
    }

    #[test]
    fn all_subscribers_receive_in_publish_order() {
        let b = broadcaster();
        let first = b.subscribe();
        let second = b.subscribe();

        for n in 0..5 {
            b.publish(&update(n));
        }

        for sub in [&first, &second] {
            let got: Vec<i64> = sub
                .rx
                .try_iter()
                .map(|u| match u.tag.value {
                    Some(TagValue::Int(n)) => n,
                    _ => unreachable!(),
                })
                .collect();
            assert_eq!(got, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn broken_subscriber_is_pruned_without_disturbing_others() {
        let b = broadcaster();
        let alive = b.subscribe();
        let broken = b.subscribe();
        drop(broken.rx);
        assert_eq!(b.subscriber_count(), 2);

        for n in 0..3 {
            b.publish(&update(n));
        }

        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(alive.rx.try_iter().count(), 3);
    }

    #[test]
    fn full_channel_drops_event_but_keeps_subscriber() {
        let b = Broadcaster::with_capacity(1, Arc::new(EngineMetrics::default()));
        let slow = b.subscribe();

        b.publish(&update(0));
        b.publish(&update(1));

        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(slow.rx.try_iter().count(), 1);
    }

    #[test]
    fn unsubscribe_removes_handle() {
        let b = broadcaster();
        let sub = b.subscribe();
        b.unsubscribe(sub.id);
        assert_eq!(b.subscriber_count(), 0);
    }
}
