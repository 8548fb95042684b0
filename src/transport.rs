use std::net::{Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpListener;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Frames longer than this without a terminating tag are treated as garbage.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

const MESSAGE_OPEN: &[u8] = b"<message";
const MESSAGE_CLOSE: &[u8] = b"</message>";
const XML_DECL_OPEN: &[u8] = b"<?xml";

/// Binds the chat listening socket, retrying once on an ephemeral port if
/// the preferred one is taken.
pub async fn bind_listener(preferred: u16) -> Result<TcpListener> {
    match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, preferred))).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            tracing::warn!(
                port = preferred,
                error = %e,
                "couldn't bind chat port, switching to an ephemeral one"
            );
            TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
                .await
                .map_err(|source| Error::Bind {
                    port: preferred,
                    source,
                })
        }
    }
}

/// Splits a byte stream into tag-delimited frames.
///
/// A `<message` element runs to its `</message>` (or its own `/>`), an XML
/// declaration runs through the tag that follows it, and anything else ends
/// at the first `>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Byte offset one past the end of the first complete frame in `buf`.
fn frame_end(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(MESSAGE_OPEN) {
        let head_end = find(buf, b">", 0)?;
        if buf[head_end - 1] == b'/' {
            return Some(head_end + 1);
        }
        return find(buf, MESSAGE_CLOSE, head_end).map(|pos| pos + MESSAGE_CLOSE.len());
    }
    if buf.starts_with(XML_DECL_OPEN) {
        let decl_end = find(buf, b"?>", 0)? + 2;
        return find(buf, b">", decl_end).map(|pos| pos + 1);
    }
    // Wait for enough bytes to tell a `<message` apart from a shorter tag.
    if MESSAGE_OPEN.starts_with(buf) || XML_DECL_OPEN.starts_with(buf) {
        return None;
    }
    find(buf, b">", 0).map(|pos| pos + 1)
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let leading = src
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        src.advance(leading);
        if src.is_empty() {
            return Ok(None);
        }

        match frame_end(&src[..]) {
            Some(end) => {
                let frame = src.split_to(end);
                Ok(Some(String::from_utf8_lossy(&frame).into_owned()))
            }
            None if src.len() > MAX_FRAME_LEN => Err(Error::FrameTooLarge(MAX_FRAME_LEN)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // A truncated trailer; hand it up so it gets classified and logged.
        let rest = src.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

impl Encoder<String> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: String, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(frame.len());
        dst.put_slice(frame.as_bytes());
        Ok(())
    }
}
