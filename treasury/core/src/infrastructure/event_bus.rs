// Event Bus Implementation - Pub/Sub for Treasury Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Enables real-time event streaming to audit sinks, dashboards and observers.
//
// In-memory only: events are lost on restart. Channels settle before
// shutdown, so the durable record is the settlement itself.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::channel::ChannelId;
use crate::domain::events::{ChannelEvent, GovernanceEvent, SessionEvent, StreamEvent};

/// Unified treasury event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreasuryEvent {
    Channel(ChannelEvent),
    Stream(StreamEvent),
    Governance(GovernanceEvent),
    Session(SessionEvent),
}

/// Event bus for publishing and subscribing to treasury events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<TreasuryEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    /// Default: 1000 events
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

    /// Publish a channel lifecycle or payment event
    pub fn publish_channel_event(&self, event: ChannelEvent) {
        self.publish(TreasuryEvent::Channel(event));
    }

    /// Publish a streaming payment event
    pub fn publish_stream_event(&self, event: StreamEvent) {
        self.publish(TreasuryEvent::Stream(event));
    }

    /// Publish a circuit breaker / escalation event
    pub fn publish_governance_event(&self, event: GovernanceEvent) {
        self.publish(TreasuryEvent::Governance(event));
    }

    /// Publish a session authorization event
    pub fn publish_session_event(&self, event: SessionEvent) {
        self.publish(TreasuryEvent::Session(event));
    }

    /// Publish a treasury event to all subscribers
    fn publish(&self, event: TreasuryEvent) {
        debug!("Publishing event: {:?}", event);

        // send() returns the number of receivers that received the message
        let receiver_count = self.sender.send(event.clone()).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all treasury events
    /// Returns a receiver that can be used to listen for events
    pub fn subscribe(&self) -> EventReceiver {
        let receiver = self.sender.subscribe();
        EventReceiver { receiver }
    }

    /// Subscribe and filter for a specific channel ID
    /// Useful for streaming the audit trail of a single channel
    pub fn subscribe_channel(&self, channel_id: ChannelId) -> ChannelEventReceiver {
        let receiver = self.sender.subscribe();
        ChannelEventReceiver {
            receiver,
            channel_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver for all treasury events
pub struct EventReceiver {
    receiver: broadcast::Receiver<TreasuryEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocks until event is available)
    pub async fn recv(&mut self) -> Result<TreasuryEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<TreasuryEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for channel-specific events (filtered)
pub struct ChannelEventReceiver {
    receiver: broadcast::Receiver<TreasuryEvent>,
    channel_id: ChannelId,
}

impl ChannelEventReceiver {
    /// Receive the next event for the subscribed channel ID
    /// Filters out events from other channels
    pub async fn recv(&mut self) -> Result<ChannelEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            // Filter for channel events matching our ID
            if let TreasuryEvent::Channel(channel_event) = event {
                if self.matches_channel(&channel_event) {
                    return Ok(channel_event);
                }
            }
            // Continue loop if event doesn't match
        }
    }

    fn matches_channel(&self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::ChannelOpened { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::ChannelActivated { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::PaymentProcessed { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::UpdateAcknowledged { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::ChannelClosing { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::ChannelClosed { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::ChannelDisputed { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::DisputeResolved { channel_id, .. } => channel_id == &self.channel_id,
            ChannelEvent::ChannelExpired { channel_id, .. } => channel_id == &self.channel_id,
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

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
