use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use plait_types::StreamMessage;

/// Keepalive cadence during silent periods so consumers and intermediary
/// proxies do not time out the connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Per-subscriber channel capacity. A subscriber that falls this far behind
/// is torn down rather than stalling the broadcast for everyone else.
const SUBSCRIBER_BUFFER: usize = 256;

/// One live consumer attached to an active plan's event stream. Dropping
/// the subscription detaches it.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<StreamMessage>,
}

/// Fans one upstream event sequence out to many long-lived consumers.
/// Delivery to a single subscriber is ordered; across subscribers nothing
/// is implied. Sends never block: a full buffer drops that subscriber.
#[derive(Debug, Default)]
pub struct StreamBroadcaster {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<StreamMessage>>>,
}

impl StreamBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, delivering `replay` into its channel before it
    /// can observe any newly broadcast event. The caller serializes this
    /// against appends so the replay is a consistent prefix.
    pub fn subscribe_with_replay(&self, replay: Vec<StreamMessage>) -> Subscription {
        let capacity = SUBSCRIBER_BUFFER.max(replay.len() + 16);
        let (tx, rx) = mpsc::channel(capacity);
        for msg in replay {
            // Capacity covers the whole replay, so this cannot fail.
            let _ = tx.try_send(msg);
        }
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        Subscription { id, events: rx }
    }

    /// Idempotent removal. Returns whether the subscriber was still known.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Best-effort fanout. Subscribers whose buffer is full or whose
    /// receiver is gone are dropped from the set.
    pub fn send(&self, msg: &StreamMessage) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|id, tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscription_id = %id, "subscriber too slow, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Deliver a terminal event to every subscriber, then close all
    /// channels. Subsequent sends are no-ops.
    pub fn finish(&self, terminal: &StreamMessage) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, tx) in subs.iter() {
            let _ = tx.try_send(terminal.clone());
        }
        subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &str) -> StreamMessage {
        StreamMessage::Chunk {
            content: s.to_string(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_order_per_subscriber() {
        let bus = StreamBroadcaster::new();
        let mut sub = bus.subscribe_with_replay(vec![StreamMessage::Start]);
        bus.send(&chunk("a"));
        bus.send(&chunk("b"));
        bus.finish(&StreamMessage::Done);

        assert_eq!(sub.events.recv().await, Some(StreamMessage::Start));
        assert_eq!(sub.events.recv().await, Some(chunk("a")));
        assert_eq!(sub.events.recv().await, Some(chunk("b")));
        assert_eq!(sub.events.recv().await, Some(StreamMessage::Done));
        assert_eq!(sub.events.recv().await, None);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_stalling_others() {
        let bus = StreamBroadcaster::new();
        let slow = bus.subscribe_with_replay(Vec::new());
        let mut fast = bus.subscribe_with_replay(Vec::new());

        // `fast` drains after every send; `slow` never reads and overflows.
        let mut seen = Vec::new();
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.send(&chunk(&i.to_string()));
            seen.push(fast.events.try_recv().unwrap());
        }
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(seen.first(), Some(&chunk("0")));
        assert_eq!(seen.len(), SUBSCRIBER_BUFFER + 10);
        drop(slow);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = StreamBroadcaster::new();
        let sub = bus.subscribe_with_replay(Vec::new());
        assert!(bus.unsubscribe(sub.id));
        assert!(!bus.unsubscribe(sub.id));
    }

    #[tokio::test]
    async fn finish_closes_all_channels() {
        let bus = StreamBroadcaster::new();
        let mut a = bus.subscribe_with_replay(Vec::new());
        let mut b = bus.subscribe_with_replay(Vec::new());
        bus.finish(&StreamMessage::Aborted);

        assert_eq!(a.events.recv().await, Some(StreamMessage::Aborted));
        assert_eq!(a.events.recv().await, None);
        assert_eq!(b.events.recv().await, Some(StreamMessage::Aborted));
        assert_eq!(b.events.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
