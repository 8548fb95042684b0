use serde::Serialize;
use tokio::sync::broadcast;

use crate::peer::PeerRecord;
use crate::protocol::ChatMessage;
use crate::status::PresenceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingState {
    Started,
    Stopped,
}

/// Receiver of everything the engine reports upward: presence changes,
/// incoming messages and typing notifications.
pub trait EventSink: Send + Sync {
    fn presence_changed(&self, peer: &PeerRecord, old: PresenceStatus);
    fn message_received(&self, message: &ChatMessage, from: &PeerRecord);
    fn typing_changed(&self, peer: &PeerRecord, state: TypingState);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProviderEvent {
    PresenceChanged { peer: PeerRecord, old: PresenceStatus },
    MessageReceived { message: ChatMessage, from: PeerRecord },
    Typing { peer: PeerRecord, state: TypingState },
}

/// Fan-out of [`ProviderEvent`]s to any number of subscribers. Events sent
/// while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProviderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: ProviderEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn presence_changed(&self, peer: &PeerRecord, old: PresenceStatus) {
        tracing::info!(peer = %peer.id, from = %old, to = %peer.status, "presence changed");
        self.publish(ProviderEvent::PresenceChanged {
            peer: peer.clone(),
            old,
        });
    }

    fn message_received(&self, message: &ChatMessage, from: &PeerRecord) {
        tracing::debug!(peer = %from.id, id = %message.id, "message received");
        self.publish(ProviderEvent::MessageReceived {
            message: message.clone(),
            from: from.clone(),
        });
    }

    fn typing_changed(&self, peer: &PeerRecord, state: TypingState) {
        self.publish(ProviderEvent::Typing {
            peer: peer.clone(),
            state,
        });
    }
}
