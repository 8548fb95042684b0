use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use crate::config::ProviderConfig;
use crate::directory::ContactDirectory;
use crate::discovery::DiscoveryService;
use crate::error::{Error, Result};
use crate::events::{EventBus, ProviderEvent};
use crate::peer::PeerRecord;
use crate::presence::{LocalPresenceRecord, PresenceAnnouncer};
use crate::protocol::ChatMessage;
use crate::session::{self, SessionContext};
use crate::status::PresenceStatus;

/// One local link-local chat account: its announcement, its view of the
/// peers around it and the sessions it has open with them.
pub struct ZeroconfProvider {
    initial_status: PresenceStatus,
    bus: EventBus,
    sessions: SessionContext,
    announcer: PresenceAnnouncer,
}

impl ZeroconfProvider {
    pub fn new(config: &ProviderConfig, discovery: Arc<dyn DiscoveryService>) -> Self {
        let local = LocalPresenceRecord::from_config(config);
        let bus = EventBus::default();
        let sessions = SessionContext {
            local_id: local.id.clone(),
            directory: ContactDirectory::new(),
            events: Arc::new(bus.clone()),
            tracker: TaskTracker::new(),
            connect_timeout: config.connect_timeout(),
        };
        let announcer = PresenceAnnouncer::new(local, config.port, discovery, sessions.clone());
        Self {
            initial_status: config.initial_status,
            bus,
            sessions,
            announcer,
        }
    }

    pub fn id(&self) -> &str {
        &self.sessions.local_id
    }

    pub fn local_record(&self) -> LocalPresenceRecord {
        self.announcer.record()
    }

    pub fn status(&self) -> PresenceStatus {
        self.announcer.status()
    }

    /// Goes to the configured initial status.
    pub async fn start(&self) -> Result<()> {
        self.announcer.start(self.initial_status).await
    }

    pub async fn change_status(&self, status: PresenceStatus) -> Result<()> {
        self.announcer.change_status(status).await
    }

    pub fn set_status_message(&self, message: &str) -> Result<()> {
        self.announcer.set_status_message(message)
    }

    /// Subscribes to presence, message and typing events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.bus.subscribe()
    }

    pub fn directory(&self) -> &ContactDirectory {
        &self.sessions.directory
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.sessions.directory.peers()
    }

    pub fn peer(&self, id: &str) -> Option<PeerRecord> {
        self.sessions.directory.find(id)
    }

    /// Queues `text` for `peer_id`, opening a session if needed. Delivery is
    /// best effort.
    pub fn send_message(&self, peer_id: &str, text: &str) -> Result<ChatMessage> {
        let message = ChatMessage::text(text);
        self.deliver(peer_id, message.clone())?;
        Ok(message)
    }

    pub fn send_typing(&self, peer_id: &str) -> Result<()> {
        self.deliver(peer_id, ChatMessage::typing())
    }

    fn deliver(&self, peer_id: &str, message: ChatMessage) -> Result<()> {
        if !self.status().is_online() {
            return Err(Error::NotOnline);
        }
        // A session may end between lookup and send; one fresh one is enough.
        for _ in 0..2 {
            let handle = session::session_for(&self.sessions, peer_id)?;
            if handle.send(message.clone()) {
                return Ok(());
            }
            tracing::debug!(peer = peer_id, session = handle.id(), "session ended under us, reopening");
            self.sessions.directory.unbind_session(peer_id, handle.id());
        }
        Err(Error::PeerOffline(peer_id.to_string()))
    }

    /// Forgets a peer, closing its session first.
    pub fn unsubscribe(&self, peer_id: &str) -> Result<PeerRecord> {
        let (peer, session) = self
            .sessions
            .directory
            .remove(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        if let Some(session) = session {
            session.close();
        }
        tracing::info!(peer = peer_id, "removed peer");
        Ok(peer)
    }

    /// Goes Offline and waits for every session and background task.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.change_status(PresenceStatus::Offline).await;
        self.sessions.tracker.close();
        self.sessions.tracker.wait().await;
        tracing::info!(id = self.id(), "provider stopped");
        result
    }
}
