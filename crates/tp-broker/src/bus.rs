// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broadcast-based fan-out for lifecycle events.
//!
//! Every [`ComputeCommandResult`] is delivered to all current
//! subscribers; nothing is retained for late joiners. Duplicates may
//! occur on retries, so subscribers must treat frames idempotently.

use tokio::sync::broadcast;
use tp_core::ComputeCommandResult;
use uuid::Uuid;

/// Default channel capacity of the event bus.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out exchange for lifecycle events.
pub struct EventBus {
    tx: broadcast::Sender<ComputeCommandResult>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with the given channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Events published
    /// while nobody listens are dropped.
    pub fn publish(&self, event: ComputeCommandResult) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events, optionally filtered to one
    /// correlation uuid. Dropping the subscription releases the channel.
    pub fn subscribe(&self, filter: Option<Uuid>) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle receiving lifecycle events from an [`EventBus`].
pub struct EventSubscription {
    rx: broadcast::Receiver<ComputeCommandResult>,
    filter: Option<Uuid>,
}

impl EventSubscription {
    /// Receive the next matching event.
    ///
    /// Returns `None` when the bus is gone. A lagged subscriber skips
    /// the overwritten events and continues with the next available one.
    pub async fn recv(&mut self) -> Option<ComputeCommandResult> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.is_none_or(|uuid| event.correlation_uuid == uuid) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_core::ComputationState;

    fn frame(uuid: Uuid, status: ComputationState) -> ComputeCommandResult {
        ComputeCommandResult::now(uuid, status, None)
    }

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(None);
        let mut b = bus.subscribe(None);
        let uuid = Uuid::new_v4();

        bus.publish(frame(uuid, ComputationState::Pending));

        assert_eq!(a.recv().await.unwrap().correlation_uuid, uuid);
        assert_eq!(b.recv().await.unwrap().correlation_uuid, uuid);
    }

    #[tokio::test]
    async fn filter_forwards_only_matching_frames() {
        let bus = EventBus::new();
        let wanted = Uuid::new_v4();
        let mut sub = bus.subscribe(Some(wanted));

        bus.publish(frame(Uuid::new_v4(), ComputationState::Started));
        bus.publish(frame(wanted, ComputationState::Success));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.correlation_uuid, wanted);
        assert_eq!(event.status, ComputationState::Success);
    }

    #[tokio::test]
    async fn no_backlog_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish(frame(Uuid::new_v4(), ComputationState::Pending));

        let mut sub = bus.subscribe(None);
        let next = Uuid::new_v4();
        bus.publish(frame(next, ComputationState::Started));

        assert_eq!(sub.recv().await.unwrap().correlation_uuid, next);
    }

    #[tokio::test]
    async fn dropping_subscription_releases_the_channel() {
        let bus = EventBus::new();
        let sub = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
