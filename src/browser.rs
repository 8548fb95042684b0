//! Turns discovery notifications into directory entries and presence
//! changes.
//!
//! Handlers run on the event pump and must not block: anything that has to
//! wait on the discovery service is spawned onto the provider's task tracker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::directory::{Admission, ContactDirectory};
use crate::discovery::{self, DiscoveryEvent, DiscoveryService, RecordType, RecordUpdate, ResolvedRecord, SERVICE_TYPE};
use crate::events::EventSink;
use crate::peer::{self, ClientFlavor, PeerRecord};
use crate::status::PresenceStatus;

/// Pause between two resolution attempts for a newly announced service.
pub const RESOLVE_RETRY_INTERVAL: Duration = Duration::from_millis(2);
/// How long one resolution attempt waits on the discovery cache.
pub const RESOLVE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a record update waits for the refreshed record.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct PeerDiscoveryListener {
    local_id: String,
    discovery: Arc<dyn DiscoveryService>,
    directory: ContactDirectory,
    events: Arc<dyn EventSink>,
    tasks: TaskTracker,
    online: CancellationToken,
}

impl PeerDiscoveryListener {
    /// `online` is cancelled when the local peer goes Offline, which ends
    /// the event pump and every pending resolution.
    pub fn new(
        local_id: impl Into<String>,
        discovery: Arc<dyn DiscoveryService>,
        directory: ContactDirectory,
        events: Arc<dyn EventSink>,
        tasks: TaskTracker,
        online: CancellationToken,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            discovery,
            directory,
            events,
            tasks,
            online,
        }
    }

    /// Feeds discovery events to the handlers until going Offline or the
    /// discovery service stops browsing.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        loop {
            tokio::select! {
                _ = self.online.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        tracing::debug!("discovery listener stopped");
    }

    pub fn dispatch(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::ServiceAdded {
                instance,
                service_type,
            } => self.on_service_added(&instance, &service_type),
            DiscoveryEvent::ServiceRemoved { instance, .. } => self.on_service_removed(&instance),
            DiscoveryEvent::ServiceResolved(record) => self.on_service_resolved(&record),
            DiscoveryEvent::RecordUpdated(update) => self.on_record_updated(&update),
        }
    }

    pub fn on_service_added(&self, instance: &str, service_type: &str) {
        if instance == self.local_id {
            return;
        }
        tracing::debug!(peer = instance, "service detected, resolving");
        self.spawn_resolution(instance, service_type);
    }

    /// Retries resolution until it succeeds or the local peer goes Offline;
    /// our own announcement may still be propagating when a peer appears.
    fn spawn_resolution(&self, instance: &str, service_type: &str) {
        let this = self.clone();
        let instance = instance.to_string();
        let service_type = service_type.to_string();
        self.tasks.spawn(async move {
            loop {
                let attempt = tokio::select! {
                    _ = this.online.cancelled() => return,
                    res = discovery::resolve(&*this.discovery, &service_type, &instance, RESOLVE_ATTEMPT_TIMEOUT) => res,
                };
                match attempt {
                    Ok(_) => break,
                    Err(e) => tracing::error!(peer = %instance, error = %e, "service info not in cache, retrying"),
                }
                tokio::time::sleep(RESOLVE_RETRY_INTERVAL).await;
            }
            if !this.online.is_cancelled() {
                this.discovery.request_resolve(&service_type, &instance);
            }
        });
    }

    /// Marks the peer Offline. The record stays in the directory.
    pub fn on_service_removed(&self, instance: &str) {
        if instance == self.local_id {
            return;
        }
        let Some(change) = self
            .directory
            .set_status(instance, PresenceStatus::Offline, None)
        else {
            return;
        };
        if let Some(session) = change.session {
            session.close();
        }
        tracing::info!(peer = instance, "peer went offline");
        if change.old != PresenceStatus::Offline {
            self.events.presence_changed(&change.peer, change.old);
        }
    }

    pub fn on_service_resolved(&self, record: &ResolvedRecord) {
        let id = record.instance.as_str();
        if id == self.local_id {
            return;
        }
        // IPv6 peers are not supported yet.
        let Some(ip) = record.ipv4() else {
            tracing::debug!(peer = id, addresses = ?record.addresses, "ignoring peer without an IPv4 address");
            return;
        };

        let port = match record.property("port.p2pj") {
            Some(port) => port.trim().parse::<u16>().ok(),
            None => Some(record.port),
        };
        let Some(port) = port.filter(|p| *p > 0) else {
            tracing::error!(peer = id, "peer announced itself without a usable chat port");
            return;
        };

        let mut peer = PeerRecord::volatile(
            id,
            peer::display_name(&record.properties, id),
            SocketAddr::new(ip.into(), port),
        );
        peer.flavor = ClientFlavor::detect(&record.properties);
        peer.status_message = record.property("msg").unwrap_or_default().to_string();
        peer.resolved = true;

        match self.directory.admit(peer.clone()) {
            Ok(Admission::AlreadyKnown) => {
                // Re-announced after going away: pick up its status again.
                let away = self
                    .directory
                    .find(id)
                    .is_some_and(|p| p.status == PresenceStatus::Offline);
                if away {
                    tracing::info!(peer = id, "peer is back");
                    self.refresh(record);
                } else {
                    tracing::debug!(peer = id, "already in the contact list, skipping");
                }
                return;
            }
            Ok(Admission::Replaced) => {
                tracing::info!(peer = id, addr = %peer.socket_addr(), "peer reappeared at a new address");
            }
            Ok(Admission::Inserted) => {
                tracing::info!(peer = id, addr = %peer.socket_addr(), flavor = ?peer.flavor, "discovered peer");
            }
            Err(e) => {
                tracing::warn!(peer = id, error = %e, "couldn't add peer");
                return;
            }
        }

        let status = status_of(record);
        if let Some(change) = self.directory.set_status(id, status, None) {
            self.events.presence_changed(&change.peer, change.old);
        }
        self.discovery.watch_record(&record.service_type, id);
    }

    pub fn on_record_updated(&self, update: &RecordUpdate) {
        // Don't rely on the discovery library to filter for us.
        let relevant = update.record_type == RecordType::Txt
            && update.class_in
            && update.unique
            && update.name.ends_with(SERVICE_TYPE);
        if !relevant {
            return;
        }
        let instance = discovery::instance_name(&update.name, SERVICE_TYPE).to_string();
        if instance == self.local_id {
            return;
        }

        if self.directory.find(&instance).is_none() {
            tracing::warn!(peer = %instance, "record update without a previous announcement, resolving");
            self.spawn_resolution(&instance, SERVICE_TYPE);
            return;
        }

        tracing::debug!(peer = %instance, "record changed, fetching fresh data");
        let this = self.clone();
        self.tasks.spawn(async move {
            let refreshed = tokio::select! {
                _ = this.online.cancelled() => return,
                res = discovery::resolve(&*this.discovery, SERVICE_TYPE, &instance, REFRESH_TIMEOUT) => res,
            };
            match refreshed {
                Ok(record) => this.refresh(&record),
                Err(e) => tracing::error!(peer = %instance, error = %e, "updated record not in cache"),
            }
        });
    }

    fn refresh(&self, record: &ResolvedRecord) {
        let message = record.property("msg").map(str::to_string);
        let Some(change) = self
            .directory
            .set_status(&record.instance, status_of(record), message)
        else {
            return;
        };
        if let Some(session) = change.session {
            session.close();
        }
        self.events.presence_changed(&change.peer, change.old);
    }
}

/// Announced status, defaulting to Online when missing or unrecognised.
fn status_of(record: &ResolvedRecord) -> PresenceStatus {
    record
        .property("status")
        .and_then(PresenceStatus::from_txt)
        .unwrap_or(PresenceStatus::Online)
}
