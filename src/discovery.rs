use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

pub const SERVICE_TYPE: &str = "_presence._tcp.local.";

const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A service record we announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub instance: String,
    pub service_type: String,
    pub port: u16,
    pub properties: Vec<(String, String)>,
}

impl ServiceRecord {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance, self.service_type)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A remote service record as seen after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub instance: String,
    pub service_type: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub properties: HashMap<String, String>,
}

impl ResolvedRecord {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addresses.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Ptr,
    Srv,
    Txt,
    Other(u16),
}

/// Low-level notification that a DNS record changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub name: String,
    pub record_type: RecordType,
    pub class_in: bool,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    ServiceAdded {
        instance: String,
        service_type: String,
    },
    ServiceRemoved {
        instance: String,
        service_type: String,
    },
    ServiceResolved(ResolvedRecord),
    RecordUpdated(RecordUpdate),
}

/// The multicast-DNS service the engine announces itself through and learns
/// about peers from.
pub trait DiscoveryService: Send + Sync {
    fn register(&self, record: &ServiceRecord) -> Result<()>;
    /// Replaces the properties of a registered record without withdrawing it.
    fn update(&self, record: &ServiceRecord) -> Result<()>;
    fn unregister(&self, record: &ServiceRecord) -> Result<()>;
    fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>>;
    fn stop_browse(&self, service_type: &str) -> Result<()>;
    /// Latest resolved data for `instance`, if any.
    fn lookup(&self, service_type: &str, instance: &str) -> Option<ResolvedRecord>;
    /// Asks for `instance` to be delivered again as a `ServiceResolved` event.
    fn request_resolve(&self, service_type: &str, instance: &str);
    /// Subscribes to `RecordUpdated` events for `instance`.
    fn watch_record(&self, service_type: &str, instance: &str);
}

/// Polls [`DiscoveryService::lookup`] until it answers or `timeout` runs out.
pub async fn resolve(
    discovery: &dyn DiscoveryService,
    service_type: &str,
    instance: &str,
    timeout: Duration,
) -> Result<ResolvedRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(record) = discovery.lookup(service_type, instance) {
            return Ok(record);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::ResolutionTimeout(instance.to_string()));
        }
        tokio::time::sleep(RESOLVE_POLL_INTERVAL).await;
    }
}

pub fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
}

#[derive(Default)]
struct MdnsState {
    cache: HashMap<String, ResolvedRecord>,
    watched: HashSet<String>,
    events: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
}

/// [`DiscoveryService`] backed by the `mdns-sd` daemon.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    host: String,
    ip: IpAddr,
    state: Arc<Mutex<MdnsState>>,
    registered: Mutex<Option<String>>,
    tasks: TaskTracker,
}

fn lock(state: &Mutex<MdnsState>) -> MutexGuard<'_, MdnsState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        let ip = local_ip().map_err(|e| Error::Discovery(e.to_string()))?;
        let system_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        Ok(Self {
            daemon,
            host: format!("{}.local.", system_hostname.trim_end_matches(".local")),
            ip,
            state: Arc::new(Mutex::new(MdnsState::default())),
            registered: Mutex::new(None),
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_address(&self) -> IpAddr {
        self.ip
    }

    fn service_info(&self, record: &ServiceRecord) -> Result<ServiceInfo> {
        let properties: Vec<(&str, &str)> = record
            .properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let info = ServiceInfo::new(
            &record.service_type,
            &record.instance,
            &self.host,
            &self.ip.to_string(),
            record.port,
            &properties[..],
        )?;
        Ok(info)
    }

    /// Withdraws anything still registered and stops the daemon.
    pub async fn shutdown(&self) {
        let fullname = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(fullname) = fullname {
            let _ = self.daemon.unregister(&fullname);
            // Let the goodbye packet go out before the daemon thread stops.
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::error!("Failed to stop mDNS daemon: {}", e);
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn forward(state: &Mutex<MdnsState>, event: ServiceEvent, service_type: &str) {
    let mut state = lock(state);
    let event = match event {
        ServiceEvent::ServiceFound(_, fullname) => DiscoveryEvent::ServiceAdded {
            instance: instance_name(&fullname, service_type).to_string(),
            service_type: service_type.to_string(),
        },
        ServiceEvent::ServiceResolved(info) => {
            let record = ResolvedRecord {
                instance: instance_name(info.get_fullname(), service_type).to_string(),
                service_type: service_type.to_string(),
                addresses: info
                    .get_addresses()
                    .iter()
                    .filter_map(|ip| ip.to_string().parse().ok())
                    .collect(),
                port: info.get_port(),
                properties: info
                    .get_properties()
                    .iter()
                    .map(|p| (p.key().to_string(), p.val_str().to_string()))
                    .collect(),
            };
            let previous = state.cache.insert(record.instance.clone(), record.clone());
            match previous {
                None => DiscoveryEvent::ServiceResolved(record),
                Some(previous) if previous == record => return,
                Some(_) if state.watched.contains(&record.instance) => {
                    DiscoveryEvent::RecordUpdated(RecordUpdate {
                        name: info.get_fullname().to_string(),
                        record_type: RecordType::Txt,
                        class_in: true,
                        unique: true,
                    })
                }
                Some(_) => DiscoveryEvent::ServiceResolved(record),
            }
        }
        ServiceEvent::ServiceRemoved(_, fullname) => {
            let instance = instance_name(&fullname, service_type).to_string();
            state.cache.remove(&instance);
            DiscoveryEvent::ServiceRemoved {
                instance,
                service_type: service_type.to_string(),
            }
        }
        _ => return,
    };
    if let Some(events) = &state.events {
        let _ = events.send(event);
    }
}

impl DiscoveryService for MdnsDiscovery {
    fn register(&self, record: &ServiceRecord) -> Result<()> {
        let info = self.service_info(record)?;
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        tracing::info!(
            "Registered service: {} on {}:{}",
            fullname,
            self.ip,
            record.port
        );
        *self.registered.lock().unwrap_or_else(PoisonError::into_inner) = Some(fullname);
        Ok(())
    }

    fn update(&self, record: &ServiceRecord) -> Result<()> {
        // Re-registering an existing name re-announces it with the new TXT data.
        let info = self.service_info(record)?;
        self.daemon.register(info)?;
        Ok(())
    }

    fn unregister(&self, record: &ServiceRecord) -> Result<()> {
        let fullname = record.fullname();
        tracing::info!("Unregistering service: {}", fullname);
        self.daemon.unregister(&fullname)?;
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        if registered.as_deref() == Some(fullname.as_str()) {
            *registered = None;
        }
        Ok(())
    }

    fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let receiver = self.daemon.browse(service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).events = Some(tx);

        let state = self.state.clone();
        let service_type = service_type.to_string();
        self.tasks.spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                forward(&state, event, &service_type);
            }
            tracing::debug!("mDNS browse for {} ended", service_type);
        });
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.events = None;
            state.cache.clear();
            state.watched.clear();
        }
        self.daemon.stop_browse(service_type)?;
        Ok(())
    }

    fn lookup(&self, _service_type: &str, instance: &str) -> Option<ResolvedRecord> {
        lock(&self.state).cache.get(instance).cloned()
    }

    fn request_resolve(&self, _service_type: &str, instance: &str) {
        let state = lock(&self.state);
        if let (Some(record), Some(events)) = (state.cache.get(instance), &state.events) {
            let _ = events.send(DiscoveryEvent::ServiceResolved(record.clone()));
        }
    }

    fn watch_record(&self, _service_type: &str, instance: &str) {
        lock(&self.state).watched.insert(instance.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDiscovery;

    #[test]
    fn instance_names() {
        assert_eq!(instance_name("alice@host._presence._tcp.local.", SERVICE_TYPE), "alice@host");
        assert_eq!(instance_name("alice", SERVICE_TYPE), "alice");
    }

    #[test]
    fn ipv4_is_picked_out() {
        let record = ResolvedRecord {
            instance: "alice".into(),
            service_type: SERVICE_TYPE.into(),
            addresses: vec!["fe80::1".parse().expect("v6"), "10.0.0.2".parse().expect("v4")],
            port: 5298,
            properties: HashMap::new(),
        };
        assert_eq!(record.ipv4(), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[tokio::test]
    async fn resolve_waits_for_the_cache() {
        let discovery = Arc::new(MockDiscovery::default());
        let record = crate::test_utils::resolved("alice", "10.0.0.2", &[]);

        let late = discovery.clone();
        let publish = record.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            late.publish(publish);
        });

        let found = resolve(&*discovery, SERVICE_TYPE, "alice", Duration::from_secs(2))
            .await
            .expect("resolved");
        assert_eq!(found, record);
        assert!(matches!(
            resolve(&*discovery, SERVICE_TYPE, "bob", Duration::from_millis(30)).await,
            Err(Error::ResolutionTimeout(name)) if name == "bob"
        ));
    }
}
