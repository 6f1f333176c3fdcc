//! In-process fan-out of detection events.
//!
//! Built on a broadcast channel so slow or failed subscribers can never
//! stall a detector: a lagging receiver drops its oldest events and keeps
//! going, and publishing to zero subscribers is not an error.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use guardian_model::EventPayload;

pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EventPayload>,
    published: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Publish an event, returning the number of live subscribers it reached.
    pub fn publish(&self, event: EventPayload) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // send only errors when there are no receivers; that is fine here.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventPayload> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_model::{DetectorKind, EventSeverity};

    fn payload(message: &str) -> EventPayload {
        EventPayload {
            ts: 0,
            detector: DetectorKind::Motion,
            source: "video:cam-a".into(),
            severity: EventSeverity::Warning,
            message: message.into(),
            meta: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(payload("motion detected")), 2);
        assert_eq!(a.recv().await.unwrap().message, "motion detected");
        assert_eq!(b.recv().await.unwrap().message, "motion detected");
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(payload("nobody listening")), 0);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_stall_producer() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.publish(payload(&format!("event {i}")));
        }
        // The receiver lost the overwritten events but the producer never
        // blocked; the receiver resumes at the oldest retained event.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert_eq!(missed, 8),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().message, "event 8");
    }
}
