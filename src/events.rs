//! Upward events for external consumers
//!
//! The scheduler/connector pair publishes lifecycle and OTA events through
//! an [`EventBus`]; consumers subscribe and receive their own channel.
//! Publishing never blocks — subscribers that stopped listening are pruned.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

/// Firmware update status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    /// Update sequence started
    Begin,
    /// Update sequence completed
    Success,
    /// Update sequence failed
    Fail,
}

/// Events emitted by the scheduler/connector pair
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Logical connection is being established
    Connecting,
    /// Logical connection established
    Connected,
    /// Logical connection is being torn down
    Disconnecting,
    /// Logical connection is down
    Disconnected,
    /// Another node joined the network
    PeerConnected {
        /// MAC address of the peer
        mac: String,
    },
    /// A node left the network
    PeerDisconnected {
        /// MAC address of the peer
        mac: String,
    },
    /// Firmware update status change
    OtaStatus(OtaStatus),
    /// Firmware update progress (0-100)
    OtaProgress(u8),
}

/// Fan-out bus over crossbeam channels
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber; each subscriber gets every event published after
    /// this call
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to all live subscribers, pruning dropped ones
    pub fn publish(&self, event: Event) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_each_receive_published_events() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(Event::Connecting);
        bus.publish(Event::Connected);

        assert_eq!(a.try_recv().unwrap(), Event::Connecting);
        assert_eq!(a.try_recv().unwrap(), Event::Connected);
        assert_eq!(b.try_recv().unwrap(), Event::Connecting);
        assert_eq!(b.try_recv().unwrap(), Event::Connected);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        {
            let _dead = bus.subscribe();
        }
        let live = bus.subscribe();

        bus.publish(Event::Disconnected);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(live.try_recv().unwrap(), Event::Disconnected);
    }
}
