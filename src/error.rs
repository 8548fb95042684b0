use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Neither the preferred nor an ephemeral port could be bound.
    #[error("couldn't bind chat listener on port {port} or an ephemeral port")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("directory conflict: {id} collides with {existing} at {addr}")]
    Conflict {
        id: String,
        existing: String,
        addr: SocketAddr,
    },

    #[error("chat frame from unidentifiable sender {0}")]
    UnresolvedSender(IpAddr),

    #[error("service record {0} could not be resolved")]
    ResolutionTimeout(String),

    #[error("discovery service failure: {0}")]
    Discovery(String),

    #[error("no peer named {0}")]
    UnknownPeer(String),

    #[error("peer {0} is offline")]
    PeerOffline(String),

    #[error("provider is offline")]
    NotOnline,

    #[error("chat listener closed: {0}")]
    ListenerClosed(#[source] std::io::Error),

    #[error("frame exceeds {0} bytes without a terminating tag")]
    FrameTooLarge(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<mdns_sd::Error> for Error {
    fn from(e: mdns_sd::Error) -> Self {
        Error::Discovery(e.to_string())
    }
}
