//! Link-local chat wire format.
//!
//! A stream is a sequence of tag-delimited pseudo-XML fragments written back
//! to back over one TCP socket: a stream header, any number of `<message>`
//! elements, and a closing `</stream:stream>`. There is no length prefix.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::peer::ClientFlavor;

pub const STREAM_CLOSE: &str = "</stream:stream>";

const XML_DECL: &str = "<?xml version='1.0' encoding='UTF-8' ?>";
const STREAM_NS: &str =
    "xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'";
const EVENT_NS: &str = "jabber:x:event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    StreamOpen,
    StreamClose,
    ChatText,
    Typing,
    Delivered,
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    pub content_type: String,
    pub encoding: String,
}

impl ChatMessage {
    fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            content_type: "text/plain".to_string(),
            encoding: "UTF-8".to_string(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageKind::ChatText, content)
    }

    pub fn typing() -> Self {
        Self::new(MessageKind::Typing, "")
    }

    pub fn stream_open() -> Self {
        Self::new(MessageKind::StreamOpen, "")
    }

    pub fn stream_close() -> Self {
        Self::new(MessageKind::StreamClose, "")
    }

    /// Decodes one received frame.
    pub fn from_frame(frame: &str) -> Self {
        let kind = classify(frame);
        let content = match kind {
            MessageKind::ChatText => extract_between(frame, "<body>", "</body>")
                .map(unescape)
                .unwrap_or_default(),
            MessageKind::Delivered => extract_between(frame, "<id>", "</id>")
                .map(unescape)
                .unwrap_or_default(),
            _ => String::new(),
        };
        Self::new(kind, content)
    }

    /// Serializes for a peer of the given flavor. `local` and `remote` are the
    /// announced identifiers used for addressing.
    pub fn to_frame(&self, flavor: ClientFlavor, local: &str, remote: &str) -> String {
        match self.kind {
            MessageKind::StreamOpen => stream_open(flavor, local, remote),
            MessageKind::StreamClose => STREAM_CLOSE.to_string(),
            MessageKind::ChatText => text_frame(&escape(&self.content), &self.id, flavor, local, remote),
            MessageKind::Typing => format!(
                "{}<body></body><x xmlns='{EVENT_NS}'><composing/><id>{}</id></x></message>",
                message_head(flavor, local, remote, None),
                escape(&self.id)
            ),
            MessageKind::Delivered => format!(
                "{}<x xmlns='{EVENT_NS}'><delivered/><id>{}</id></x></message>",
                message_head(flavor, local, remote, None),
                escape(&self.content)
            ),
            MessageKind::Undefined => String::new(),
        }
    }
}

/// Stream header. Native, Gaim and iChat peers share the bare form; plain
/// XMPP peers get the from/to/version qualified one.
pub fn stream_open(flavor: ClientFlavor, local: &str, remote: &str) -> String {
    match flavor {
        ClientFlavor::Xmpp => format!(
            "{XML_DECL}<stream:stream {STREAM_NS} from='{}' to='{}' version='1.0'>",
            escape(local),
            escape(remote)
        ),
        ClientFlavor::Native | ClientFlavor::Gaim | ClientFlavor::IChat => {
            format!("{XML_DECL}<stream:stream {STREAM_NS}>")
        }
    }
}

fn message_head(flavor: ClientFlavor, local: &str, remote: &str, id: Option<&str>) -> String {
    let (to, from) = (escape(remote), escape(local));
    match (flavor, id) {
        (ClientFlavor::IChat, _) => format!("<message to='{to}' type='chat'>"),
        (ClientFlavor::Xmpp, Some(id)) => {
            format!("<message to='{to}' from='{from}' type='chat' id='{}'>", escape(id))
        }
        _ => format!("<message to='{to}' from='{from}' type='chat'>"),
    }
}

fn text_frame(body: &str, id: &str, flavor: ClientFlavor, local: &str, remote: &str) -> String {
    let head = message_head(flavor, local, remote, Some(id));
    match flavor {
        ClientFlavor::Native | ClientFlavor::Xmpp => {
            format!("{head}<body>{body}</body></message>")
        }
        ClientFlavor::Gaim => format!(
            "{head}<body>{body}</body>\
             <html xmlns='http://jabber.org/protocol/xhtml-im'>\
             <body xmlns='http://www.w3.org/1999/xhtml'>{body}</body></html>\
             <x xmlns='{EVENT_NS}'><composing/></x></message>"
        ),
        ClientFlavor::IChat => format!(
            "{head}<body>{body}</body>\
             <html xmlns='http://www.w3.org/1999/xhtml'>\
             <body ichatballooncolor='#7BB5EE' ichattextcolor='#000000'>\
             <font face='Helvetica' ABSZ='12' color='#000000'>{body}</font></body></html>\
             <x xmlns='{EVENT_NS}'><offline/><delivered/><composing/></x></message>"
        ),
    }
}

/// Maps any frame to exactly one kind. Rules are checked in order; the first
/// match wins.
pub fn classify(frame: &str) -> MessageKind {
    let frame = frame.trim();
    if frame.starts_with("<?xml") || frame.starts_with("<stream") {
        return MessageKind::StreamOpen;
    }
    if frame.ends_with("stream>") {
        return MessageKind::StreamClose;
    }
    let has_body = extract_between(frame, "<body>", "</body>").is_some();
    if frame.contains("<delivered/>") && !has_body {
        return MessageKind::Delivered;
    }
    if !frame.starts_with("<message") {
        return MessageKind::Undefined;
    }
    match (has_body, extract_between(frame, "<id>", "</id>").is_some()) {
        (true, true) => MessageKind::Typing,
        (true, false) => MessageKind::ChatText,
        (false, _) => MessageKind::Undefined,
    }
}

fn extract_between<'a>(frame: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = frame.find(open)? + open.len();
    let len = frame[start..].find(close)?;
    Some(&frame[start..start + len])
}

pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

/// Decodes entity and character references. Text with a malformed reference
/// is passed through untouched.
pub fn unescape(text: &str) -> String {
    match quick_xml::escape::unescape(text) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            tracing::debug!(error = %e, "undecodable reference in body");
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const FLAVORS: [ClientFlavor; 4] = [
        ClientFlavor::Native,
        ClientFlavor::Gaim,
        ClientFlavor::IChat,
        ClientFlavor::Xmpp,
    ];

    #[test]
    fn id_tag_takes_precedence_over_body() {
        assert_eq!(
            classify("<message><id></id><body>hi</body></message>"),
            MessageKind::Typing
        );
        assert_eq!(classify("<message><body>hi</body></message>"), MessageKind::ChatText);
    }

    #[test]
    fn control_frames() {
        assert_eq!(classify("<?xml version='1.0'?><stream:stream>"), MessageKind::StreamOpen);
        assert_eq!(classify("  <stream:stream xmlns='jabber:client'>"), MessageKind::StreamOpen);
        assert_eq!(classify("</stream:stream>"), MessageKind::StreamClose);
        assert_eq!(
            classify("<message><x><delivered/><id>1</id></x></message>"),
            MessageKind::Delivered
        );
        assert_eq!(classify("<presence/>"), MessageKind::Undefined);
        assert_eq!(classify("<message type='chat'></message>"), MessageKind::Undefined);
        assert_eq!(classify(""), MessageKind::Undefined);
    }

    #[test]
    fn body_is_extracted_verbatim() {
        let msg = ChatMessage::from_frame("<message to='b'><body>see  you &lt;3</body></message>");
        assert_eq!(msg.kind, MessageKind::ChatText);
        assert_eq!(msg.content, "see  you <3");
    }

    #[test]
    fn character_references_are_decoded() {
        let msg = ChatMessage::from_frame(
            "<message><body>it&#39;s &#x27;fine&#x27; &amp; &#233;</body></message>",
        );
        assert_eq!(msg.content, "it's 'fine' & \u{e9}");
        assert_eq!(unescape("5 &lt 6 &bogus;"), "5 &lt 6 &bogus;");
    }

    #[test]
    fn escaped_text_survives_a_frame() {
        let original = "<b>\"quoted\" & 'single'</b>";
        let frame = ChatMessage::text(original).to_frame(ClientFlavor::Gaim, "a@x", "b@y");
        assert!(!frame.contains("<b>"));
        assert_eq!(ChatMessage::from_frame(&frame).content, original);
    }

    #[test]
    fn serialized_kinds_classify_back() {
        let messages = [
            ChatMessage::stream_open(),
            ChatMessage::stream_close(),
            ChatMessage::text("hello"),
            ChatMessage::typing(),
            ChatMessage::from_frame("<message><x><delivered/><id>42</id></x></message>"),
        ];
        for flavor in FLAVORS {
            for msg in &messages {
                let frame = msg.to_frame(flavor, "me@here", "you@there");
                assert_eq!(classify(&frame), msg.kind, "{flavor:?}: {frame}");
            }
        }
    }

    #[test]
    fn native_text_frame_shape() {
        let msg = ChatMessage::text("hello");
        assert_eq!(
            msg.to_frame(ClientFlavor::Native, "a@x", "b@y"),
            "<message to='b@y' from='a@x' type='chat'><body>hello</body></message>"
        );
    }

    #[test]
    fn only_xmpp_header_is_qualified() {
        let xmpp = stream_open(ClientFlavor::Xmpp, "a@x", "b@y");
        assert!(xmpp.contains("from='a@x' to='b@y' version='1.0'"));
        for flavor in [ClientFlavor::Native, ClientFlavor::Gaim, ClientFlavor::IChat] {
            let header = stream_open(flavor, "a@x", "b@y");
            assert!(!header.contains("version='1.0'>"));
            assert_eq!(header, stream_open(ClientFlavor::Native, "", ""));
        }
    }

    #[test]
    fn markup_in_text_survives() {
        let text = "</body><id>x</id> & more";
        for flavor in FLAVORS {
            let frame = ChatMessage::text(text).to_frame(flavor, "a", "b");
            let decoded = ChatMessage::from_frame(&frame);
            assert_eq!(decoded.kind, MessageKind::ChatText);
            assert_eq!(decoded.content, text);
        }
    }

    proptest! {
        #[test]
        fn classification_is_total(frame in ".*") {
            let first = classify(&frame);
            prop_assert_eq!(first, classify(&frame));
        }

        #[test]
        fn text_content_round_trips(text in "[^\u{0}]{0,64}") {
            let frame = ChatMessage::text(text.clone()).to_frame(ClientFlavor::Native, "a", "b");
            let decoded = ChatMessage::from_frame(&frame);
            prop_assert_eq!(decoded.kind, MessageKind::ChatText);
            prop_assert_eq!(decoded.content, text);
        }
    }
}
