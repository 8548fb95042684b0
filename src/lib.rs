//! Link-local presence and chat over mDNS/DNS-SD, compatible with the
//! Bonjour chat flavors spoken by iChat, Gaim and XEP-0174 clients.

pub mod browser;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod events;
pub mod listener;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod shutdown;
pub mod status;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use config::ProviderConfig;
pub use discovery::{DiscoveryService, MdnsDiscovery};
pub use error::{Error, Result};
pub use events::{EventSink, ProviderEvent, TypingState};
pub use peer::{ClientFlavor, PeerRecord};
pub use protocol::{ChatMessage, MessageKind};
pub use provider::ZeroconfProvider;
pub use status::PresenceStatus;
