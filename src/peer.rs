use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::status::PresenceStatus;

/// Software family announced in our own `client` and `node` TXT properties.
pub const CLIENT_NAME: &str = "zeroconf-chat";

/// Wire-compatibility variant of a peer, inferred from its TXT properties.
/// Only affects how chat frames are wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFlavor {
    /// Another instance of this software.
    Native,
    /// Gaim/Pidgin style: announces `jid` but no `node`.
    Gaim,
    /// iChat style: no `jid` at all.
    IChat,
    /// Anything else; gets the from/to/version qualified stream header.
    Xmpp,
}

impl ClientFlavor {
    pub fn detect(props: &HashMap<String, String>) -> Self {
        let is_native = props
            .get("client")
            .is_some_and(|c| c.eq_ignore_ascii_case(CLIENT_NAME));
        if is_native {
            return ClientFlavor::Native;
        }
        match (props.contains_key("jid"), props.contains_key("node")) {
            (true, false) => ClientFlavor::Gaim,
            (false, _) => ClientFlavor::IChat,
            (true, true) => ClientFlavor::Xmpp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub flavor: ClientFlavor,
    pub status: PresenceStatus,
    pub status_message: String,
    /// Always false: discovered peers are never written to durable storage.
    pub persistent: bool,
    pub resolved: bool,
}

impl PeerRecord {
    /// A freshly discovered, not yet announced peer.
    pub fn volatile(id: impl Into<String>, display_name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            ip: addr.ip(),
            port: addr.port(),
            flavor: ClientFlavor::Xmpp,
            status: PresenceStatus::Offline,
            status_message: String::new(),
            persistent: false,
            resolved: false,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// `1st` + `last`, falling back to `nick` and then the identifier.
pub fn display_name(props: &HashMap<String, String>, id: &str) -> String {
    let first = props.get("1st").map(|s| s.trim()).unwrap_or_default();
    let last = props.get("last").map(|s| s.trim()).unwrap_or_default();
    let name = match (first.is_empty(), last.is_empty()) {
        (false, false) => format!("{first} {last}"),
        (false, true) => first.to_string(),
        (true, false) => last.to_string(),
        (true, true) => String::new(),
    };
    if !name.is_empty() {
        return name;
    }
    match props.get("nick").map(|s| s.trim()) {
        Some(nick) if !nick.is_empty() => nick.to_string(),
        _ => id.to_string(),
    }
}
