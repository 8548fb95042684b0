//! The local peer's announcement and its online/offline lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::browser::PeerDiscoveryListener;
use crate::config::ProviderConfig;
use crate::discovery::{DiscoveryService, ServiceRecord, SERVICE_TYPE};
use crate::error::Result;
use crate::listener::ChatListener;
use crate::peer::CLIENT_NAME;
use crate::session::SessionContext;
use crate::status::PresenceStatus;
use crate::transport;

/// What we announce about ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPresenceRecord {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub status_message: String,
    pub status: PresenceStatus,
    /// Port the chat listener is bound to; 0 while offline.
    pub port: u16,
}

impl LocalPresenceRecord {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            id: config.account_id(),
            first_name: config.first_name.clone(),
            last_name: config.last_name.clone(),
            email: config.email.clone(),
            status_message: config.status_message.clone(),
            status: PresenceStatus::Offline,
            port: 0,
        }
    }

    fn nick(&self) -> &str {
        match self.first_name.trim() {
            "" => &self.id,
            first => first,
        }
    }

    /// TXT properties understood by Gaim, iChat and XEP-0174 clients.
    pub fn txt_properties(&self) -> Vec<(String, String)> {
        let port = self.port.to_string();
        [
            ("txtvers", "1"),
            ("1st", self.first_name.as_str()),
            ("last", self.last_name.as_str()),
            ("email", self.email.as_str()),
            ("jid", self.id.as_str()),
            ("nick", self.nick()),
            ("msg", self.status_message.as_str()),
            ("status", self.status.txt_token()),
            ("port.p2pj", port.as_str()),
            ("phsh", "000"),
            ("vc", "C!"),
            ("ext", ""),
            ("ver", "1"),
            ("node", CLIENT_NAME),
            ("client", CLIENT_NAME),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn service_record(&self) -> ServiceRecord {
        ServiceRecord {
            instance: self.id.clone(),
            service_type: SERVICE_TYPE.to_string(),
            port: self.port,
            properties: self.txt_properties(),
        }
    }
}

/// Bookkeeping for the current online period.
#[derive(Default)]
struct Period {
    generation: u64,
    online: Option<CancellationToken>,
}

/// Keeps the discovery service's view of us in step with
/// [`LocalPresenceRecord`], and owns the tasks that only run while online:
/// the discovery event pump and the chat listener.
#[derive(Clone)]
pub struct PresenceAnnouncer {
    local: Arc<Mutex<LocalPresenceRecord>>,
    // Serializes transitions; held across the listener bind.
    period: Arc<tokio::sync::Mutex<Period>>,
    preferred_port: u16,
    discovery: Arc<dyn DiscoveryService>,
    sessions: SessionContext,
}

impl PresenceAnnouncer {
    pub fn new(
        local: LocalPresenceRecord,
        preferred_port: u16,
        discovery: Arc<dyn DiscoveryService>,
        sessions: SessionContext,
    ) -> Self {
        Self {
            local: Arc::new(Mutex::new(local)),
            period: Arc::new(tokio::sync::Mutex::new(Period::default())),
            preferred_port,
            discovery,
            sessions,
        }
    }

    fn local(&self) -> MutexGuard<'_, LocalPresenceRecord> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self) -> LocalPresenceRecord {
        self.local().clone()
    }

    pub fn status(&self) -> PresenceStatus {
        self.local().status
    }

    pub async fn start(&self, initial: PresenceStatus) -> Result<()> {
        self.change_status(initial).await
    }

    pub async fn change_status(&self, new: PresenceStatus) -> Result<()> {
        let mut period = self.period.lock().await;
        let old = self.status();
        if old == new {
            return Ok(());
        }
        tracing::info!(from = %old, to = %new, "changing local status");

        match (old, new) {
            (_, PresenceStatus::Offline) => {
                self.withdraw(&mut period);
                Ok(())
            }
            (PresenceStatus::Offline, _) => self.go_online(&mut period, new).await,
            _ => {
                let record = {
                    let mut local = self.local();
                    local.status = new;
                    local.service_record()
                };
                self.discovery.update(&record)
            }
        }
    }

    /// Changes the announced status message. Only republished while online.
    pub fn set_status_message(&self, message: &str) -> Result<()> {
        let record = {
            let mut local = self.local();
            local.status_message = message.to_string();
            if !local.status.is_online() {
                return Ok(());
            }
            local.service_record()
        };
        self.discovery.update(&record)
    }

    async fn go_online(&self, period: &mut Period, status: PresenceStatus) -> Result<()> {
        let socket = transport::bind_listener(self.preferred_port).await?;
        let port = socket.local_addr()?.port();

        let record = {
            let mut local = self.local();
            local.port = port;
            local.status = status;
            local.service_record()
        };
        if let Err(e) = self.discovery.register(&record) {
            self.local().status = PresenceStatus::Offline;
            return Err(e);
        }
        let events = match self.discovery.browse(SERVICE_TYPE) {
            Ok(events) => events,
            Err(e) => {
                let _ = self.discovery.unregister(&record);
                self.local().status = PresenceStatus::Offline;
                return Err(e);
            }
        };

        let online = CancellationToken::new();
        period.generation += 1;
        period.online = Some(online.clone());

        let tracker = &self.sessions.tracker;
        let browser = PeerDiscoveryListener::new(
            record.instance.clone(),
            self.discovery.clone(),
            self.sessions.directory.clone(),
            self.sessions.events.clone(),
            tracker.clone(),
            online.clone(),
        );
        tracker.spawn(browser.run(events));

        let listener = ChatListener::new(socket, self.sessions.clone());
        let this = self.clone();
        let generation = period.generation;
        tracker.spawn(async move {
            if let Err(e) = listener.run(online).await {
                tracing::error!(error = %e, "chat listener failed, going offline");
                let mut period = this.period.lock().await;
                if period.generation == generation && period.online.is_some() {
                    this.withdraw(&mut period);
                }
            }
        });

        tracing::info!(id = %record.instance, port, "announced presence");
        Ok(())
    }

    /// Goes silent: stops announcing and browsing, ends the online period's
    /// tasks and marks every known peer Offline.
    fn withdraw(&self, period: &mut Period) {
        let record = {
            let mut local = self.local();
            local.status = PresenceStatus::Offline;
            local.service_record()
        };
        if let Some(online) = period.online.take() {
            online.cancel();
        }
        if let Err(e) = self.discovery.unregister(&record) {
            tracing::warn!(error = %e, "couldn't withdraw announcement");
        }
        if let Err(e) = self.discovery.stop_browse(SERVICE_TYPE) {
            tracing::warn!(error = %e, "couldn't stop browsing");
        }

        for change in self.sessions.directory.mark_all_offline() {
            if let Some(session) = change.session {
                session.close();
            }
            if change.old != PresenceStatus::Offline {
                self.sessions.events.presence_changed(&change.peer, change.old);
            }
        }
        self.local().port = 0;
    }
}
