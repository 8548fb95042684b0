use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::peer::PeerRecord;
use crate::session::{SessionHandle, SessionId};
use crate::status::PresenceStatus;

struct Entry {
    record: PeerRecord,
    session: Option<SessionHandle>,
}

/// Outcome of [`ContactDirectory::bind_session`].
#[derive(Debug)]
pub enum Binding {
    Bound,
    AlreadyBound(SessionHandle),
    PeerOffline,
    UnknownPeer,
}

/// Outcome of [`ContactDirectory::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Inserted,
    Replaced,
    AlreadyKnown,
}

/// A status transition applied to one peer. When the new status is Offline
/// the peer's session is detached and handed back so the caller can close it.
#[derive(Debug)]
pub struct StatusChange {
    pub peer: PeerRecord,
    pub old: PresenceStatus,
    pub session: Option<SessionHandle>,
}

/// In-memory table of discovered peers, shared by the discovery pipeline,
/// the chat listener and every chat session. Never performs I/O.
#[derive(Clone, Default)]
pub struct ContactDirectory {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces by identifier. The identifier must keep its
    /// endpoint and the endpoint must not belong to anyone else.
    pub fn upsert(&self, record: PeerRecord) -> Result<Option<PeerRecord>> {
        let mut table = self.table();
        check_conflicts(&table, &record)?;
        match table.get_mut(&record.id) {
            Some(entry) => Ok(Some(std::mem::replace(&mut entry.record, record))),
            None => {
                insert(&mut table, record);
                Ok(None)
            }
        }
    }

    /// Lookup-then-insert for freshly resolved peers, in one step. A peer
    /// already known at the same endpoint is left untouched; an Offline peer
    /// that reappears at a new ip or port is replaced.
    pub fn admit(&self, record: PeerRecord) -> Result<Admission> {
        let mut table = self.table();
        let mut outcome = Admission::Inserted;
        if let Some(existing) = table.get(&record.id) {
            if existing.record.socket_addr() == record.socket_addr() {
                return Ok(Admission::AlreadyKnown);
            }
            if existing.record.status == PresenceStatus::Offline && existing.session.is_none() {
                let stale = table.remove(&record.id);
                if let Err(e) = check_conflicts(&table, &record) {
                    if let Some(stale) = stale {
                        table.insert(record.id.clone(), stale);
                    }
                    return Err(e);
                }
                outcome = Admission::Replaced;
            }
        }
        check_conflicts(&table, &record)?;
        insert(&mut table, record);
        Ok(outcome)
    }

    pub fn find(&self, id: &str) -> Option<PeerRecord> {
        self.table().get(id).map(|e| e.record.clone())
    }

    /// Lookup for inbound connections, which only carry a remote address.
    /// Several records may share an ip; the one with a live session wins,
    /// then an online one.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<PeerRecord> {
        let table = self.table();
        best_at(&table, ip).map(|e| e.record.clone())
    }

    pub fn remove(&self, id: &str) -> Option<(PeerRecord, Option<SessionHandle>)> {
        self.table().remove(id).map(|e| (e.record, e.session))
    }

    pub fn remove_by_ip(&self, ip: IpAddr) -> Option<(PeerRecord, Option<SessionHandle>)> {
        let mut table = self.table();
        let id = best_at(&table, ip)?.record.id.clone();
        table.remove(&id).map(|e| (e.record, e.session))
    }

    /// Sets one peer's status, and its status message when given.
    pub fn set_status(
        &self,
        id: &str,
        status: PresenceStatus,
        message: Option<String>,
    ) -> Option<StatusChange> {
        let mut table = self.table();
        let entry = table.get_mut(id)?;
        Some(apply_status(entry, status, message))
    }

    /// Forces every peer Offline in one pass, detaching all sessions. Peers
    /// that were already Offline are not reported.
    pub fn mark_all_offline(&self) -> Vec<StatusChange> {
        let mut table = self.table();
        table
            .values_mut()
            .filter(|e| e.record.status.is_online() || e.session.is_some())
            .map(|e| apply_status(e, PresenceStatus::Offline, None))
            .collect()
    }

    /// Attaches a session to a peer unless one is already attached.
    pub fn bind_session(&self, id: &str, handle: SessionHandle) -> Binding {
        let mut table = self.table();
        let Some(entry) = table.get_mut(id) else {
            return Binding::UnknownPeer;
        };
        if !entry.record.status.is_online() {
            return Binding::PeerOffline;
        }
        match &entry.session {
            Some(existing) if !existing.is_closed() => Binding::AlreadyBound(existing.clone()),
            _ => {
                entry.session = Some(handle);
                Binding::Bound
            }
        }
    }

    /// Detaches `session` from the peer, but only if it is still the one
    /// bound there.
    pub fn unbind_session(&self, id: &str, session: SessionId) -> bool {
        let mut table = self.table();
        match table.get_mut(id) {
            Some(entry) if entry.session.as_ref().is_some_and(|s| s.id() == session) => {
                entry.session = None;
                true
            }
            _ => false,
        }
    }

    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.table()
            .get(id)
            .and_then(|e| e.session.clone())
            .filter(|s| !s.is_closed())
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.session(id).is_some()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.table().values().map(|e| e.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

fn best_at(table: &BTreeMap<String, Entry>, ip: IpAddr) -> Option<&Entry> {
    table.values().filter(|e| e.record.ip == ip).min_by_key(|e| {
        let live = e.session.as_ref().is_some_and(|s| !s.is_closed());
        (!live, !e.record.status.is_online())
    })
}

fn check_conflicts(table: &BTreeMap<String, Entry>, record: &PeerRecord) -> Result<()> {
    let addr = record.socket_addr();
    if let Some(existing) = table.get(&record.id) {
        if existing.record.socket_addr() != addr {
            return Err(Error::Conflict {
                id: record.id.clone(),
                existing: existing.record.id.clone(),
                addr: existing.record.socket_addr(),
            });
        }
    }
    match table
        .values()
        .find(|e| e.record.id != record.id && e.record.socket_addr() == addr)
    {
        Some(other) => Err(Error::Conflict {
            id: record.id.clone(),
            existing: other.record.id.clone(),
            addr,
        }),
        None => Ok(()),
    }
}

fn insert(table: &mut BTreeMap<String, Entry>, record: PeerRecord) {
    table.insert(
        record.id.clone(),
        Entry {
            record,
            session: None,
        },
    );
}

fn apply_status(entry: &mut Entry, status: PresenceStatus, message: Option<String>) -> StatusChange {
    let old = entry.record.status;
    entry.record.status = status;
    if let Some(message) = message {
        entry.record.status_message = message;
    }
    let session = match status {
        PresenceStatus::Offline => entry.session.take(),
        _ => None,
    };
    StatusChange {
        peer: entry.record.clone(),
        old,
        session,
    }
}
