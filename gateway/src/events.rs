/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Internal event bus: a bounded fan-out channel carrying lifecycle
//! notifications to any number of subscribers (logging, metrics, external
//! bridges). Publishing never blocks the publisher — a full channel drops
//! the event and logs a warning rather than applying backpressure.

use std::sync::Mutex;

use async_channel::{bounded, Receiver, Sender};
use async_trait::async_trait;
use tracing::warn;

use crate::registry::DeviceStatus;

/// The full set of lifecycle notifications the event bus carries:
/// `ConnectionAccepted`, `ConnectionClosed`, `DeviceRegistered`,
/// `DeviceStatusChanged`, `Heartbeat`, `HeartbeatTimeout`, `CommandSent`,
/// `CommandConfirmed`, `CommandFailed`.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConnectionAccepted { conn_id: u64 },
    ConnectionClosed { conn_id: u64 },
    DeviceRegistered { device_id: String, iccid: String },
    DeviceStatusChanged { device_id: String, status: DeviceStatus },
    Heartbeat { device_id: String },
    HeartbeatTimeout { device_id: String },
    CommandSent {
        device_id: String,
        command: u8,
        message_id: u16,
    },
    CommandConfirmed {
        device_id: String,
        command: u8,
        message_id: u16,
    },
    CommandFailed {
        device_id: String,
        command: u8,
        message_id: u16,
        reason: String,
    },
}

/// Publish-side seam, injected into the dispatcher/hooks/heartbeat scanner so
/// they don't need to depend on a concrete `EventBus`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Fans out every published event to every subscriber. `async-channel`
/// receivers are MPMC *competing consumers* — cloning one does not give
/// broadcast semantics, a message sent once is delivered to exactly one
/// clone. True fan-out needs one channel per subscriber; `emit` pushes into
/// all of them and drops (with a warning) into any that are full, so one
/// slow listener can never block the publisher or starve the others.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> Receiver<Event> {
        let (sender, receiver) = bounded(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(sender);
        receiver
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, event: Event) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for sender in subscribers.iter() {
            if sender.try_send(event.clone()).is_err() {
                warn!(?event, "event bus subscriber full, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        bus.emit(Event::DeviceStatusChanged {
            device_id: "04A228CD".into(),
            status: DeviceStatus::Online,
        })
        .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            Event::DeviceStatusChanged {
                device_id: "04A228CD".into(),
                status: DeviceStatus::Online,
            }
        );
    }

    #[async_std::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new(4);
        let first = bus.subscribe();
        let second = bus.subscribe();
        bus.emit(Event::ConnectionClosed { conn_id: 7 }).await;

        assert_eq!(first.recv().await.unwrap(), Event::ConnectionClosed { conn_id: 7 });
        assert_eq!(second.recv().await.unwrap(), Event::ConnectionClosed { conn_id: 7 });
    }

    #[async_std::test]
    async fn full_channel_drops_without_blocking() {
        let bus = EventBus::new(1);
        let rx = bus.subscribe();
        bus.emit(Event::ConnectionClosed { conn_id: 1 }).await;
        bus.emit(Event::ConnectionClosed { conn_id: 2 }).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first, Event::ConnectionClosed { conn_id: 1 });
    }
}
