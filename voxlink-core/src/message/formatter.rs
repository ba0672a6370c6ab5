//! Bidirectional mapping between `ConnectionMessage` and `RawWireMessage`.
//!
//! Formatters are pure and stateless. The `Connection` holds one behind an
//! `Arc<dyn MessageFormatter>` and never assumes which.
//!
//! ## Speech frame layout (`SpeechMessageFormatter`)
//!
//! Text frame:
//!
//! ```text
//! Path: speech.hypothesis\r\n
//! X-RequestId: 1c8e...\r\n
//! Content-Type: application/json\r\n
//! \r\n
//! {"Text":"hello", ...}
//! ```
//!
//! Binary frame:
//!
//! ```text
//! ┌──────────────┬───────────────────────────┬─────────────┐
//! │ u16 BE: len  │ header block (len bytes)  │ payload ... │
//! └──────────────┴───────────────────────────┴─────────────┘
//! ```
//!
//! The header block uses the same `Name: value\r\n` lines as text frames,
//! without the trailing blank line. A zero length means no headers. The
//! stream a binary frame belongs to travels in `X-StreamId`.
//!
//! ## Conversation frames (`ConversationMessageFormatter`)
//!
//! Text frames are bare JSON objects. The top-level `type` field is copied
//! into the `conversationMessageType` header on the way in. Binary frames are
//! passed through without headers.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    header_names, ConnectionMessage, Headers, MessageBody, MessageKind, RawWireMessage,
    WirePayload,
};
use crate::error::{Result, VoxlinkError};

const HEADER_TERMINATOR: &str = "\r\n\r\n";
const LINE_BREAK: &str = "\r\n";
const BINARY_HEADER_LEN_BYTES: usize = 2;

/// Contract for wire codecs.
pub trait MessageFormatter: Send + Sync + 'static {
    /// Decode an inbound frame.
    ///
    /// # Errors
    /// `VoxlinkError::MalformedMessage` when required metadata cannot be parsed.
    fn to_connection_message(&self, raw: RawWireMessage) -> Result<ConnectionMessage>;

    /// Encode an outbound message.
    ///
    /// # Errors
    /// `VoxlinkError::MalformedMessage` when the message cannot be represented
    /// on the wire.
    fn from_connection_message(&self, message: &ConnectionMessage) -> Result<RawWireMessage>;
}

// ---------------------------------------------------------------------------
// Speech formatter
// ---------------------------------------------------------------------------

/// HTTP-style header block framing used by the speech endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeechMessageFormatter;

impl SpeechMessageFormatter {
    pub fn new() -> Self {
        Self
    }

    fn serialize_headers(headers: &Headers) -> Result<String> {
        let mut out = String::new();
        for (name, value) in headers.iter() {
            if name.is_empty()
                || name.contains(':')
                || has_line_break(name)
                || has_line_break(value)
                || value.trim() != value
            {
                return Err(VoxlinkError::MalformedMessage(format!(
                    "header '{name}' cannot be serialized"
                )));
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(LINE_BREAK);
        }
        Ok(out)
    }

    /// Optional whitespace around names and values is dropped on the way in;
    /// `serialize_headers` refuses values that would need it.
    fn parse_headers(block: &str) -> Result<Headers> {
        let mut headers = Headers::new();
        for line in block.split(LINE_BREAK).filter(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                return Err(VoxlinkError::MalformedMessage(format!(
                    "header line without separator: '{line}'"
                )));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(VoxlinkError::MalformedMessage("empty header name".into()));
            }
            headers.insert(name, value.trim());
        }
        Ok(headers)
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains('\r') || s.contains('\n')
}

impl MessageFormatter for SpeechMessageFormatter {
    fn to_connection_message(&self, raw: RawWireMessage) -> Result<ConnectionMessage> {
        let id = raw.id().to_string();
        match raw.into_payload() {
            WirePayload::Text(text) => {
                let Some((block, body)) = text.split_once(HEADER_TERMINATOR) else {
                    return Err(VoxlinkError::MalformedMessage(
                        "text frame has no header terminator".into(),
                    ));
                };
                let headers = Self::parse_headers(block)?;
                if !headers.contains(header_names::PATH) {
                    return Err(VoxlinkError::MalformedMessage(
                        "text frame is missing the Path header".into(),
                    ));
                }
                ConnectionMessage::new(
                    MessageKind::Text,
                    MessageBody::Text(body.to_string()),
                    headers,
                    Some(id),
                )
            }
            WirePayload::Binary(bytes) => {
                if bytes.len() < BINARY_HEADER_LEN_BYTES {
                    return Err(VoxlinkError::MalformedMessage(format!(
                        "binary frame too short ({} bytes)",
                        bytes.len()
                    )));
                }
                let header_len = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
                let body_start = BINARY_HEADER_LEN_BYTES + header_len;
                if body_start > bytes.len() {
                    return Err(VoxlinkError::MalformedMessage(format!(
                        "binary header length {header_len} exceeds frame size {}",
                        bytes.len()
                    )));
                }
                let block = std::str::from_utf8(&bytes[BINARY_HEADER_LEN_BYTES..body_start])
                    .map_err(|e| {
                        VoxlinkError::MalformedMessage(format!("binary header is not UTF-8: {e}"))
                    })?;
                let headers = Self::parse_headers(block)?;
                ConnectionMessage::new(
                    MessageKind::Binary,
                    MessageBody::Binary(bytes.slice(body_start..)),
                    headers,
                    Some(id),
                )
            }
        }
    }

    fn from_connection_message(&self, message: &ConnectionMessage) -> Result<RawWireMessage> {
        let header_block = Self::serialize_headers(message.headers())?;
        let id = Some(message.id().to_string());

        match message.kind() {
            MessageKind::Text => {
                let body = message.text_body().unwrap_or_default();
                let mut text = String::with_capacity(header_block.len() + 2 + body.len());
                text.push_str(&header_block);
                text.push_str(LINE_BREAK);
                text.push_str(body);
                Ok(RawWireMessage::text(text, id))
            }
            MessageKind::Binary => {
                let header_len = u16::try_from(header_block.len()).map_err(|_| {
                    VoxlinkError::MalformedMessage(format!(
                        "binary header block too large ({} bytes)",
                        header_block.len()
                    ))
                })?;
                let payload = message.binary_body().cloned().unwrap_or_default();
                let mut buf =
                    BytesMut::with_capacity(BINARY_HEADER_LEN_BYTES + header_block.len() + payload.len());
                buf.put_u16(header_len);
                buf.put_slice(header_block.as_bytes());
                buf.put_slice(&payload);
                Ok(RawWireMessage::binary(buf.freeze(), id))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation formatter
// ---------------------------------------------------------------------------

/// JSON framing used by the multi-party conversation endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationMessageFormatter;

impl ConversationMessageFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl MessageFormatter for ConversationMessageFormatter {
    fn to_connection_message(&self, raw: RawWireMessage) -> Result<ConnectionMessage> {
        let id = raw.id().to_string();
        match raw.into_payload() {
            WirePayload::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                    VoxlinkError::MalformedMessage(format!("conversation frame is not JSON: {e}"))
                })?;
                let message_type = json
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| {
                        VoxlinkError::MalformedMessage(
                            "conversation frame has no string 'type' field".into(),
                        )
                    })?;
                let headers =
                    Headers::new().with(header_names::CONVERSATION_MESSAGE_TYPE, message_type);
                ConnectionMessage::new(MessageKind::Text, MessageBody::Text(text), headers, Some(id))
            }
            WirePayload::Binary(bytes) => ConnectionMessage::new(
                MessageKind::Binary,
                MessageBody::Binary(bytes),
                Headers::new(),
                Some(id),
            ),
        }
    }

    fn from_connection_message(&self, message: &ConnectionMessage) -> Result<RawWireMessage> {
        let id = Some(message.id().to_string());
        match message.kind() {
            MessageKind::Text => Ok(RawWireMessage::text(
                message.text_body().unwrap_or_default(),
                id,
            )),
            MessageKind::Binary => Ok(RawWireMessage::binary(
                message.binary_body().cloned().unwrap_or_else(Bytes::new),
                id,
            )),
        }
    }
}
