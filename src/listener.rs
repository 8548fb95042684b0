use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::directory::Binding;
use crate::error::{Error, Result};
use crate::session::{ChatSession, SessionContext, SessionHandle};

/// Accepts inbound chat connections and hands each one to a session bound
/// to the peer it comes from.
pub struct ChatListener {
    listener: TcpListener,
    ctx: SessionContext,
}

impl ChatListener {
    pub fn new(listener: TcpListener, ctx: SessionContext) -> Self {
        Self { listener, ctx }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until `shutdown` fires. An accept failure ends the loop with
    /// [`Error::ListenerClosed`].
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "chat listener started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => self.admit(socket, addr),
                    Err(e) => return Err(Error::ListenerClosed(e)),
                },
            }
        }
        tracing::debug!("chat listener stopped");
        Ok(())
    }

    fn admit(&self, socket: TcpStream, addr: SocketAddr) {
        // Only peers we discovered may talk to us.
        let Some(peer) = self.ctx.directory.find_by_ip(addr.ip()) else {
            tracing::error!(%addr, "connection from an unknown address, closing");
            return;
        };

        let (handle, commands) = SessionHandle::channel();
        match self.ctx.directory.bind_session(&peer.id, handle.clone()) {
            Binding::Bound => {
                tracing::debug!(peer = %peer.id, %addr, session = handle.id(), "accepted chat connection");
                let session = ChatSession::new(self.ctx.clone(), handle, commands, &peer);
                self.ctx.tracker.spawn(session.run_inbound(socket));
            }
            Binding::AlreadyBound(existing) => {
                tracing::warn!(peer = %peer.id, %addr, session = existing.id(), "peer already has a session, rejecting redundant connection");
            }
            Binding::PeerOffline => {
                tracing::warn!(peer = %peer.id, %addr, "connection from a peer we consider offline, closing");
            }
            Binding::UnknownPeer => {
                tracing::warn!(peer = %peer.id, %addr, "peer vanished while accepting, closing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::directory::ContactDirectory;
    use crate::events::{EventBus, ProviderEvent};
    use crate::peer::PeerRecord;
    use crate::status::PresenceStatus;
    use crate::test_utils::{peer, read_frames};

    async fn start(directory: ContactDirectory, bus: EventBus) -> (SocketAddr, CancellationToken, TaskTracker) {
        let tracker = TaskTracker::new();
        let ctx = SessionContext {
            local_id: "me@here".to_string(),
            directory,
            events: Arc::new(bus),
            tracker: tracker.clone(),
            connect_timeout: Duration::from_secs(5),
        };
        let socket = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let listener = ChatListener::new(socket, ctx);
        let addr = listener.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();
        tracker.spawn(listener.run(shutdown.clone()));
        (addr, shutdown, tracker)
    }

    fn loopback_peer(id: &str) -> PeerRecord {
        peer(id, "127.0.0.1:5298")
    }

    async fn assert_closed(socket: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
            .await
            .expect("connection closed in time")
            .unwrap_or(0);
        assert_eq!(n, 0, "expected EOF");
    }

    #[tokio::test]
    async fn unknown_address_is_turned_away() {
        let directory = ContactDirectory::new();
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let (addr, _shutdown, _tracker) = start(directory.clone(), bus).await;

        let mut socket = TcpStream::connect(addr).await.expect("connect");
        assert_closed(&mut socket).await;
        assert!(directory.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn known_peer_gets_a_session() {
        let directory = ContactDirectory::new();
        directory.upsert(loopback_peer("alice@box")).expect("upsert");
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let (addr, _shutdown, _tracker) = start(directory.clone(), bus).await;

        let mut socket = TcpStream::connect(addr).await.expect("connect");
        socket
            .write_all(b"<?xml version='1.0' encoding='UTF-8' ?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>")
            .await
            .expect("write hello");
        let hello = read_frames(&mut socket, 1).await;
        assert!(hello[0].contains("<stream:stream"));
        assert!(directory.has_session("alice@box"));

        socket
            .write_all(b"<message to='me@here' from='alice@box' type='chat'><body>hi there</body></message>")
            .await
            .expect("write message");
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        match event {
            ProviderEvent::MessageReceived { message, from } => {
                assert_eq!(message.content, "hi there");
                assert_eq!(from.id, "alice@box");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_connection_from_a_bound_peer_is_rejected() {
        let directory = ContactDirectory::new();
        directory.upsert(loopback_peer("alice@box")).expect("upsert");
        let (addr, _shutdown, _tracker) = start(directory.clone(), EventBus::default()).await;

        let _first = TcpStream::connect(addr).await.expect("connect");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first_session = directory.session("alice@box").expect("bound").id();

        let mut second = TcpStream::connect(addr).await.expect("connect");
        assert_closed(&mut second).await;
        assert_eq!(directory.session("alice@box").map(|s| s.id()), Some(first_session));
    }

    #[tokio::test]
    async fn offline_peer_is_turned_away() {
        let directory = ContactDirectory::new();
        let mut alice = loopback_peer("alice@box");
        alice.status = PresenceStatus::Offline;
        directory.upsert(alice).expect("upsert");
        let (addr, _shutdown, _tracker) = start(directory.clone(), EventBus::default()).await;

        let mut socket = TcpStream::connect(addr).await.expect("connect");
        assert_closed(&mut socket).await;
        assert!(!directory.has_session("alice@box"));
    }

    #[tokio::test]
    async fn online_peer_is_found_behind_a_stale_record_at_the_same_ip() {
        let directory = ContactDirectory::new();
        let mut alice = peer("alice@box", "127.0.0.1:5298");
        alice.status = PresenceStatus::Offline;
        directory.upsert(alice).expect("upsert alice");
        directory.upsert(peer("bob@box", "127.0.0.1:5299")).expect("upsert bob");
        let (addr, _shutdown, _tracker) = start(directory.clone(), EventBus::default()).await;

        let mut socket = TcpStream::connect(addr).await.expect("connect");
        socket
            .write_all(b"<?xml version='1.0' encoding='UTF-8' ?><stream:stream>")
            .await
            .expect("write hello");
        let hello = read_frames(&mut socket, 1).await;
        assert!(hello[0].contains("to='bob@box'"), "{}", hello[0]);
        assert!(directory.has_session("bob@box"));
        assert!(!directory.has_session("alice@box"));
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (_addr, shutdown, tracker) = start(ContactDirectory::new(), EventBus::default()).await;
        shutdown.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("listener stops");
    }
}
