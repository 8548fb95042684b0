//! Per-peer chat sessions.
//!
//! Each session is one task owning one TCP socket. Other tasks talk to it
//! through a [`SessionHandle`]; the directory keeps the handle of the session
//! bound to each peer.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::task::TaskTracker;

use crate::directory::{Binding, ContactDirectory};
use crate::error::{Error, Result};
use crate::events::{EventSink, TypingState};
use crate::peer::{ClientFlavor, PeerRecord};
use crate::protocol::{ChatMessage, MessageKind};
use crate::transport::FrameCodec;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub enum SessionCommand {
    Send(ChatMessage),
    Close,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, commands }, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Hands `message` to the session. Returns false if the session is gone.
    pub fn send(&self, message: ChatMessage) -> bool {
        self.commands.send(SessionCommand::Send(message)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Everything a session needs from the provider it runs under.
#[derive(Clone)]
pub struct SessionContext {
    pub local_id: String,
    pub directory: ContactDirectory,
    pub events: Arc<dyn EventSink>,
    pub tracker: TaskTracker,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Closed,
    Connecting,
    Negotiating,
    Open,
}

/// Local half of the stream negotiation plus the outbound queue.
///
/// Frames submitted before the local stream header went out are held back
/// and flushed, in order, right behind it.
#[derive(Debug)]
pub struct StreamState {
    phase: StreamPhase,
    local_open: bool,
    pending: String,
}

impl StreamState {
    pub fn new(phase: StreamPhase) -> Self {
        Self {
            phase,
            local_open: false,
            pending: String::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Returns the frame if it can go out now, otherwise queues it.
    pub fn submit(&mut self, frame: String) -> Option<String> {
        match self.local_open {
            true => Some(frame),
            false => {
                self.pending.push_str(&frame);
                None
            }
        }
    }

    pub fn connected(&mut self) {
        self.phase = StreamPhase::Negotiating;
    }

    /// Opens the local stream once. Yields the header followed by anything
    /// queued so far; `None` if the header was already sent.
    pub fn open_local(&mut self, hello: String) -> Option<String> {
        self.phase = StreamPhase::Open;
        if self.local_open {
            return None;
        }
        self.local_open = true;
        let mut out = hello;
        out.push_str(&std::mem::take(&mut self.pending));
        Some(out)
    }

    pub fn close(&mut self) {
        self.phase = StreamPhase::Closed;
    }
}

enum Flow {
    Continue,
    Stop,
}

type Reader = FramedRead<OwnedReadHalf, FrameCodec>;
type Writer = FramedWrite<OwnedWriteHalf, FrameCodec>;

pub struct ChatSession {
    handle: SessionHandle,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    ctx: SessionContext,
    peer_id: Option<String>,
    flavor: ClientFlavor,
    remote_ip: IpAddr,
    stream: StreamState,
}

/// Returns the session bound to `peer_id`, opening an outbound one if there
/// is none yet.
pub fn session_for(ctx: &SessionContext, peer_id: &str) -> Result<SessionHandle> {
    let peer = ctx
        .directory
        .find(peer_id)
        .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
    if let Some(handle) = ctx.directory.session(peer_id) {
        return Ok(handle);
    }

    let (handle, commands) = SessionHandle::channel();
    match ctx.directory.bind_session(peer_id, handle.clone()) {
        Binding::Bound => {
            let session = ChatSession::new(ctx.clone(), handle.clone(), commands, &peer);
            ctx.tracker.spawn(session.run_outbound(peer.socket_addr()));
            Ok(handle)
        }
        Binding::AlreadyBound(existing) => Ok(existing),
        Binding::PeerOffline => Err(Error::PeerOffline(peer_id.to_string())),
        Binding::UnknownPeer => Err(Error::UnknownPeer(peer_id.to_string())),
    }
}

impl ChatSession {
    pub fn new(
        ctx: SessionContext,
        handle: SessionHandle,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        peer: &PeerRecord,
    ) -> Self {
        Self {
            handle,
            commands,
            ctx,
            peer_id: Some(peer.id.clone()),
            flavor: peer.flavor,
            remote_ip: peer.ip,
            stream: StreamState::new(StreamPhase::Closed),
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Dials the peer, sends our header without waiting for theirs and then
    /// converses. Messages sent while connecting are queued.
    pub async fn run_outbound(mut self, addr: SocketAddr) {
        self.stream = StreamState::new(StreamPhase::Connecting);
        tracing::debug!(session = self.id(), %addr, "connecting");

        let connect = tokio::time::timeout(self.ctx.connect_timeout, TcpStream::connect(addr));
        tokio::pin!(connect);
        let socket = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(Ok(socket)) => break socket,
                    Ok(Err(e)) => {
                        tracing::warn!(session = self.id(), %addr, error = %e, "couldn't connect to peer");
                        return self.finish();
                    }
                    Err(_) => {
                        tracing::warn!(session = self.id(), %addr, "timed out connecting to peer");
                        return self.finish();
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Send(message)) => {
                        let frame = self.encode(&message);
                        let _ = self.stream.submit(frame);
                    }
                    Some(SessionCommand::Close) | None => return self.finish(),
                },
            }
        };

        self.stream.connected();
        let (read, write) = socket.into_split();
        let reader = FramedRead::new(read, FrameCodec::new());
        let mut writer = FramedWrite::new(write, FrameCodec::new());

        if let Some(opening) = self.stream.open_local(self.hello()) {
            if let Err(e) = writer.send(opening).await {
                tracing::warn!(session = self.id(), error = %e, "couldn't open stream");
                return self.finish();
            }
        }
        self.converse(reader, writer).await;
    }

    /// Serves a connection accepted by the chat listener. Our header only
    /// goes out once the peer has opened its stream.
    pub async fn run_inbound(mut self, socket: TcpStream) {
        self.stream = StreamState::new(StreamPhase::Negotiating);
        let (read, write) = socket.into_split();
        let reader = FramedRead::new(read, FrameCodec::new());
        let writer = FramedWrite::new(write, FrameCodec::new());
        self.converse(reader, writer).await;
    }

    async fn converse(mut self, mut reader: Reader, mut writer: Writer) {
        let mut close_sent = false;
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => {
                        let (flow, sent_close) = self.on_frame(&frame, &mut writer).await;
                        close_sent |= sent_close;
                        if let Flow::Stop = flow {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session = self.id(), error = %e, "chat stream failed");
                        break;
                    }
                    None => {
                        tracing::debug!(session = self.id(), "peer hung up");
                        break;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Send(message)) => {
                        let frame = self.encode(&message);
                        if let Some(frame) = self.stream.submit(frame) {
                            if let Err(e) = writer.send(frame).await {
                                tracing::warn!(session = self.id(), error = %e, "couldn't write message");
                                break;
                            }
                        }
                    }
                    Some(SessionCommand::Close) | None => break,
                },
            }
        }

        if self.stream.phase() == StreamPhase::Open && !close_sent {
            let _ = writer.send(self.encode(&ChatMessage::stream_close())).await;
        }
        let _ = writer.close().await;
        self.finish();
    }

    /// Handles one received frame. The second value reports whether the
    /// closing tag was written.
    async fn on_frame(&mut self, frame: &str, writer: &mut Writer) -> (Flow, bool) {
        let message = ChatMessage::from_frame(frame);
        match message.kind {
            MessageKind::StreamOpen => {
                self.resolve_peer();
                if let Some(opening) = self.stream.open_local(self.hello()) {
                    if let Err(e) = writer.send(opening).await {
                        tracing::warn!(session = self.id(), error = %e, "couldn't open stream");
                        return (Flow::Stop, false);
                    }
                }
                (Flow::Continue, false)
            }
            MessageKind::StreamClose => {
                tracing::debug!(session = self.id(), "peer closed the stream");
                let sent = writer.send(self.encode(&ChatMessage::stream_close())).await.is_ok();
                (Flow::Stop, sent)
            }
            MessageKind::ChatText => {
                let Some(peer) = self.resolve_peer() else {
                    let e = Error::UnresolvedSender(self.remote_ip);
                    tracing::error!(session = self.id(), error = %e, "dropping connection");
                    return (Flow::Stop, false);
                };
                self.ctx.events.message_received(&message, &peer);
                self.ctx.events.typing_changed(&peer, TypingState::Stopped);
                (Flow::Continue, false)
            }
            MessageKind::Typing => {
                if let Some(peer) = self.resolve_peer() {
                    self.ctx.events.typing_changed(&peer, TypingState::Started);
                }
                (Flow::Continue, false)
            }
            MessageKind::Delivered => (Flow::Continue, false),
            MessageKind::Undefined => {
                tracing::debug!(session = self.id(), frame, "ignoring unrecognised frame");
                (Flow::Continue, false)
            }
        }
    }

    /// Finds the peer behind this connection, by its bound identifier first
    /// and by remote address otherwise, binding to it if it has no session.
    fn resolve_peer(&mut self) -> Option<PeerRecord> {
        if let Some(peer) = self.peer_id.as_deref().and_then(|id| self.ctx.directory.find(id)) {
            return Some(peer);
        }
        let peer = self.ctx.directory.find_by_ip(self.remote_ip)?;
        if let Binding::Bound = self.ctx.directory.bind_session(&peer.id, self.handle.clone()) {
            tracing::debug!(session = self.id(), peer = %peer.id, "session bound");
        }
        self.peer_id = Some(peer.id.clone());
        self.flavor = peer.flavor;
        Some(peer)
    }

    fn remote_id(&self) -> &str {
        self.peer_id.as_deref().unwrap_or_default()
    }

    fn hello(&self) -> String {
        self.encode(&ChatMessage::stream_open())
    }

    fn encode(&self, message: &ChatMessage) -> String {
        message.to_frame(self.flavor, &self.ctx.local_id, self.remote_id())
    }

    fn finish(mut self) {
        let phase = self.stream.phase();
        self.stream.close();
        if let Some(id) = &self.peer_id {
            self.ctx.directory.unbind_session(id, self.handle.id);
        }
        tracing::debug!(session = self.id(), peer = self.remote_id(), ?phase, "session closed");
    }
}
