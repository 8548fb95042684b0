use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::discovery::{DiscoveryEvent, DiscoveryService, ResolvedRecord, ServiceRecord, SERVICE_TYPE};
use crate::error::{Error, Result};
use crate::peer::{ClientFlavor, PeerRecord};
use crate::status::PresenceStatus;
use crate::transport::FrameCodec;

// ─── Fixtures ───────────────────────────────────────────────────────────────

/// An online, resolved XMPP-flavored peer at `addr`.
pub fn peer(id: &str, addr: &str) -> PeerRecord {
    let addr = addr.parse().expect("fixture address is a valid socket address");
    let mut record = PeerRecord::volatile(id, id, addr);
    record.flavor = ClientFlavor::Xmpp;
    record.status = PresenceStatus::Online;
    record.resolved = true;
    record
}

pub fn resolved(instance: &str, ip: &str, props: &[(&str, &str)]) -> ResolvedRecord {
    ResolvedRecord {
        instance: instance.to_string(),
        service_type: SERVICE_TYPE.to_string(),
        addresses: vec![ip.parse().expect("fixture ip is valid")],
        port: 5298,
        properties: props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Reads exactly `n` frames, failing the test if they don't arrive in time.
pub async fn read_frames(socket: &mut TcpStream, n: usize) -> Vec<String> {
    let mut reader = FramedRead::new(socket, FrameCodec::new());
    let mut frames = Vec::with_capacity(n);
    while frames.len() < n {
        let next = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("frame arrives within 5s");
        match next {
            Some(Ok(frame)) => frames.push(frame),
            other => panic!("stream ended after {frames:?}: {other:?}"),
        }
    }
    frames
}

// ─── MockDiscovery ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register(ServiceRecord),
    Update(ServiceRecord),
    Unregister(String),
    Browse,
    StopBrowse,
    RequestResolve(String),
    Watch(String),
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    registered: Option<ServiceRecord>,
    cache: HashMap<String, ResolvedRecord>,
    watched: HashSet<String>,
    events: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    fail_register: bool,
}

/// In-memory discovery service that records every call.
#[derive(Default)]
pub struct MockDiscovery {
    state: Mutex<MockState>,
}

impl MockDiscovery {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock discovery lock")
    }

    /// Makes `record` resolvable.
    pub fn publish(&self, record: ResolvedRecord) {
        self.state().cache.insert(record.instance.clone(), record);
    }

    /// Delivers `event` to the current browser, if any.
    pub fn emit(&self, event: DiscoveryEvent) -> bool {
        match &self.state().events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn registered(&self) -> Option<ServiceRecord> {
        self.state().registered.clone()
    }

    pub fn is_browsing(&self) -> bool {
        self.state().events.is_some()
    }

    pub fn is_watched(&self, instance: &str) -> bool {
        self.state().watched.contains(instance)
    }

    pub fn fail_register(&self, fail: bool) {
        self.state().fail_register = fail;
    }
}

impl DiscoveryService for MockDiscovery {
    fn register(&self, record: &ServiceRecord) -> Result<()> {
        let mut state = self.state();
        if state.fail_register {
            return Err(Error::Discovery("registration refused".into()));
        }
        state.calls.push(Call::Register(record.clone()));
        state.registered = Some(record.clone());
        Ok(())
    }

    fn update(&self, record: &ServiceRecord) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Update(record.clone()));
        state.registered = Some(record.clone());
        Ok(())
    }

    fn unregister(&self, record: &ServiceRecord) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Unregister(record.instance.clone()));
        state.registered = None;
        Ok(())
    }

    fn browse(&self, _service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.calls.push(Call::Browse);
        state.events = Some(tx);
        Ok(rx)
    }

    fn stop_browse(&self, _service_type: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::StopBrowse);
        state.events = None;
        Ok(())
    }

    fn lookup(&self, _service_type: &str, instance: &str) -> Option<ResolvedRecord> {
        self.state().cache.get(instance).cloned()
    }

    fn request_resolve(&self, _service_type: &str, instance: &str) {
        let mut state = self.state();
        state.calls.push(Call::RequestResolve(instance.to_string()));
        if let (Some(record), Some(events)) = (state.cache.get(instance), &state.events) {
            let _ = events.send(DiscoveryEvent::ServiceResolved(record.clone()));
        }
    }

    fn watch_record(&self, _service_type: &str, instance: &str) {
        let mut state = self.state();
        state.calls.push(Call::Watch(instance.to_string()));
        state.watched.insert(instance.to_string());
    }
}
