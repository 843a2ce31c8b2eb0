//! Broadcast event bus.
//!
//! External observers subscribe here to learn about committed value changes
//! and link lifecycle transitions. Publishing never blocks and never fails:
//! an event with no subscribers is simply dropped.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::zone::{AttrValue, Origin};

const BUS_CAPACITY: usize = 256;

/// Events published by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The router committed a genuine value change.
    ValueChanged {
        zone: String,
        value: AttrValue,
        origin: Origin,
    },
    /// A link reached its Ready state.
    LinkConnected { link: Origin },
    /// A link left its Ready state.
    LinkDisconnected { link: Origin, reason: String },
}

/// Shared handle to the event bus.
pub type SharedBus = Arc<Bus>;

#[derive(Debug)]
pub struct Bus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Bus {
    pub fn publish(&self, event: BridgeEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }
}

pub fn create_bus() -> SharedBus {
    let (tx, _) = broadcast::channel(BUS_CAPACITY);
    Arc::new(Bus { tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_published_events() {
        let bus = create_bus();
        let mut rx = bus.subscribe();

        bus.publish(BridgeEvent::LinkConnected {
            link: Origin::Amplifier,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            BridgeEvent::LinkConnected {
                link: Origin::Amplifier
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_a_noop() {
        let bus = create_bus();
        bus.publish(BridgeEvent::LinkDisconnected {
            link: Origin::Hub,
            reason: "closed".to_string(),
        });
    }
}
