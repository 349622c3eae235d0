// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Sync Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Breakers, the client registry and the ingestion pipelines publish here;
// the daemon and tests subscribe.
//
// In-memory only: events are lost on restart.

use crate::domain::events::SyncEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to sync events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<SyncEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SyncEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only errors when nobody is listening
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all sync events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for a single provider
    /// Useful for following one breaker and its reconnects
    pub fn subscribe_provider(&self, provider: impl Into<String>) -> ProviderEventReceiver {
        ProviderEventReceiver {
            receiver: self.sender.subscribe(),
            provider: provider.into(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all sync events
pub struct EventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<SyncEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<SyncEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// Receiver for one provider's events (filtered)
pub struct ProviderEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    provider: String,
}

impl ProviderEventReceiver {
    /// Receive the next event concerning the subscribed provider
    pub async fn recv(&mut self) -> Result<SyncEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.provider() == Some(self.provider.as_str()) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::circuit::CircuitStatus;
    use chrono::Utc;

    fn transition(provider: &str) -> SyncEvent {
        SyncEvent::CircuitTransitioned {
            provider: provider.to_string(),
            from: CircuitStatus::Closed,
            to: CircuitStatus::Open,
            consecutive_failures: 5,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(transition("jira"));

        match receiver.recv().await.unwrap() {
            SyncEvent::CircuitTransitioned { provider, to, .. } => {
                assert_eq!(provider, "jira");
                assert_eq!(to, CircuitStatus::Open);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_provider("git");

        // Different provider (should be filtered out)
        event_bus.publish(transition("jira"));
        event_bus.publish(transition("git"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.provider(), Some("git"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish(transition("jira"));

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let event_bus = EventBus::default();
        event_bus.publish(transition("jira"));

        let mut late = event_bus.subscribe();
        assert!(matches!(late.try_recv(), Err(EventBusError::Empty)));
        assert!(late.drain().is_empty());
    }
}
