//! In-process event bus
//!
//! A `broadcast` channel of [`BusEvent`]s. The CLI listener, the server
//! state model and the sync tasks publish; the SSE endpoint and the
//! coordinator's shutdown handshake subscribe.

mod events;

pub use events::BusEvent;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

/// Events buffered per subscriber before a slow one starts lagging
pub const BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every current subscriber. Having none is normal
    /// (no SSE client, no shutdown in progress).
    pub fn publish(&self, event: BusEvent) {
        let kind = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => trace!("bus: {} -> {} subscriber(s)", kind, receivers),
            Err(_) => trace!("bus: {} dropped, no subscribers", kind),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_each_event() {
        let bus = create_bus();
        let mut sse = bus.subscribe();
        let mut coordinator = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(BusEvent::LmsConnected {
            host: "192.168.1.10".to_string(),
            port: 9000,
        });
        bus.publish(BusEvent::ShuttingDown { reason: None });

        for rx in [&mut sse, &mut coordinator] {
            assert_eq!(
                rx.recv().await.unwrap(),
                BusEvent::LmsConnected {
                    host: "192.168.1.10".to_string(),
                    port: 9000,
                }
            );
            assert!(matches!(
                rx.recv().await.unwrap(),
                BusEvent::ShuttingDown { .. }
            ));
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = create_bus();
        bus.publish(BusEvent::ComponentStopped {
            component: "sync".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..4 {
            bus.publish(BusEvent::CliNotification {
                player_id: "00:04:20:12:34:56".to_string(),
                event: format!("playlist jump {}", i),
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
    }
}
