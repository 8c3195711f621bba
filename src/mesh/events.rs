use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mesh::types::MeshEvent;
use crate::telemetry::MeshMetrics;

/// Publishing side of the mesh event queue.
///
/// Publishing never blocks: when the queue is full the event is dropped and
/// counted.
pub struct EventBus {
    sender: mpsc::Sender<MeshEvent>,
    subscribers: broadcast::Sender<MeshEvent>,
    dropped: AtomicU64,
    metrics: MeshMetrics,
}

/// Consuming side of the queue; logs each event and fans it out to
/// subscribers
pub struct EventLoop {
    receiver: mpsc::Receiver<MeshEvent>,
    subscribers: broadcast::Sender<MeshEvent>,
}

/// Create a bounded event queue holding at most `capacity` pending events
pub fn channel(capacity: usize, metrics: MeshMetrics) -> (EventBus, EventLoop) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let (subscribers, _) = broadcast::channel(capacity.max(1));

    let bus = EventBus {
        sender,
        subscribers: subscribers.clone(),
        dropped: AtomicU64::new(0),
        metrics,
    };
    (bus, EventLoop { receiver, subscribers })
}

impl EventBus {
    /// Enqueue an event. Returns false if it was dropped.
    pub fn publish(&self, event: MeshEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.metrics.inc_events_published();
                true
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.inc_events_dropped();
                warn!(
                    "Event queue full, dropped {} for {} ({} dropped so far)",
                    event.kind, event.service_id, dropped
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                debug!("Event loop stopped, discarding {} for {}", event.kind, event.service_id);
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.subscribers.subscribe()
    }

    /// Number of events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventLoop {
    /// Drain the queue until `shutdown` is cancelled or every publisher is gone
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Event loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.receiver.recv() => match event {
                    Some(event) => {
                        info!(kind = %event.kind, service = %event.service_id, "Mesh event");
                        // No subscribers is not an error
                        let _ = self.subscribers.send(event);
                    }
                    None => break,
                },
            }
        }

        info!("Event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::mesh::types::EventKind;

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let metrics = MeshMetrics::new().unwrap();
        let (bus, _event_loop) = channel(2, metrics.clone());

        assert!(bus.publish(MeshEvent::new(EventKind::ServiceRegistered, "a")));
        assert!(bus.publish(MeshEvent::new(EventKind::ServiceRegistered, "b")));
        assert!(!bus.publish(MeshEvent::new(EventKind::ServiceRegistered, "c")));
        assert!(!bus.publish(MeshEvent::new(EventKind::ServiceRegistered, "d")));

        assert_eq!(bus.dropped(), 2);
        assert_eq!(metrics.events_dropped(), 2);
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let (bus, event_loop) = channel(8, MeshMetrics::new().unwrap());
        let mut rx = bus.subscribe();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(event_loop.run(shutdown.clone()));

        bus.publish(MeshEvent::new(EventKind::PolicyApplied, "svc-1").with_detail("policy", "lb"));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::PolicyApplied);
        assert_eq!(event.details["policy"], "lb");

        shutdown.cancel();
        handle.await.unwrap();

        // Publishing after shutdown is harmless
        assert!(!bus.publish(MeshEvent::new(EventKind::PolicyApplied, "svc-1")));
        assert_eq!(bus.dropped(), 0);
    }
}
