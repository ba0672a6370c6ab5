//! Transport-agnostic messages and the raw frames they map to.
//!
//! ```text
//! ConnectionMessage ──MessageFormatter──► RawWireMessage ──Transport──► socket
//!        ▲                                      │
//!        └──────────────MessageFormatter────────┘
//! ```

pub mod formatter;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VoxlinkError};

pub use formatter::{ConversationMessageFormatter, MessageFormatter, SpeechMessageFormatter};

/// Well-known header names.
pub mod header_names {
    pub const PATH: &str = "Path";
    pub const REQUEST_ID: &str = "X-RequestId";
    pub const STREAM_ID: &str = "X-StreamId";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const TIMESTAMP: &str = "X-Timestamp";
    pub const CONNECTION_ID: &str = "X-ConnectionId";
    pub const CONVERSATION_MESSAGE_TYPE: &str = "conversationMessageType";
}

/// Dashless UUID v4, used for correlation, request, and connection ids.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Frame discriminant shared by both message representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Binary,
}

/// Ordered header store. Names are unique and compared ASCII case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A replaced header keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder-style `insert`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Message payload. `ConnectionMessage::new` turns `Empty` into an empty
/// body of the message's kind, so a built message never carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Empty,
    Text(String),
    Binary(Bytes),
}

impl MessageBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            MessageBody::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageBody::Empty => true,
            MessageBody::Text(s) => s.is_empty(),
            MessageBody::Binary(b) => b.is_empty(),
        }
    }
}

/// Application-level message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMessage {
    kind: MessageKind,
    body: MessageBody,
    headers: Headers,
    id: String,
}

impl ConnectionMessage {
    /// Build a message. A fresh correlation id is generated when `id` is `None`.
    /// An `Empty` body becomes `Text("")` or an empty `Binary`, which is what
    /// a formatter decodes it back to.
    ///
    /// # Errors
    /// `VoxlinkError::ProtocolViolation` when the body does not fit the kind
    /// (a text body on a binary message or the reverse).
    pub fn new(
        kind: MessageKind,
        body: MessageBody,
        headers: Headers,
        id: Option<String>,
    ) -> Result<Self> {
        match (kind, &body) {
            (MessageKind::Text, MessageBody::Binary(_)) => {
                return Err(VoxlinkError::ProtocolViolation(
                    "binary body on a text message".into(),
                ))
            }
            (MessageKind::Binary, MessageBody::Text(_)) => {
                return Err(VoxlinkError::ProtocolViolation(
                    "text body on a binary message".into(),
                ))
            }
            _ => {}
        }
        let body = match (kind, body) {
            (MessageKind::Text, MessageBody::Empty) => MessageBody::Text(String::new()),
            (MessageKind::Binary, MessageBody::Empty) => MessageBody::Binary(Bytes::new()),
            (_, body) => body,
        };
        Ok(Self {
            kind,
            body,
            headers,
            id: id.unwrap_or_else(new_id),
        })
    }

    pub fn text(body: impl Into<String>, headers: Headers) -> Self {
        Self {
            kind: MessageKind::Text,
            body: MessageBody::Text(body.into()),
            headers,
            id: new_id(),
        }
    }

    pub fn binary(body: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            kind: MessageKind::Binary,
            body: MessageBody::Binary(body.into()),
            headers,
            id: new_id(),
        }
    }

    /// Speech-protocol message with the standard routing headers filled in.
    pub fn speech_text(
        path: &str,
        request_id: &str,
        content_type: &str,
        body: impl Into<String>,
    ) -> Self {
        let headers = Headers::new()
            .with(header_names::PATH, path)
            .with(header_names::REQUEST_ID, request_id)
            .with(header_names::TIMESTAMP, timestamp_now())
            .with(header_names::CONTENT_TYPE, content_type);
        Self::text(body, headers)
    }

    /// Speech-protocol audio message. An empty payload marks end of stream.
    pub fn speech_audio(request_id: &str, stream_id: &str, payload: impl Into<Bytes>) -> Self {
        let headers = Headers::new()
            .with(header_names::PATH, "audio")
            .with(header_names::REQUEST_ID, request_id)
            .with(header_names::TIMESTAMP, timestamp_now())
            .with(header_names::STREAM_ID, stream_id);
        Self::binary(payload, headers)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn text_body(&self) -> Option<&str> {
        self.body.as_text()
    }

    pub fn binary_body(&self) -> Option<&Bytes> {
        self.body.as_binary()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Option<&str> {
        self.headers.get(header_names::PATH)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(header_names::REQUEST_ID)
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.headers.get(header_names::STREAM_ID)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header_names::CONTENT_TYPE)
    }
}

/// Physical frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    Text(String),
    Binary(Bytes),
}

/// Frame exchanged with the transport. The payload always matches the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWireMessage {
    kind: MessageKind,
    payload: WirePayload,
    id: String,
}

impl RawWireMessage {
    /// # Errors
    /// `VoxlinkError::ProtocolViolation` when `payload` does not match `kind`.
    pub fn new(kind: MessageKind, payload: WirePayload, id: Option<String>) -> Result<Self> {
        let matches = matches!(
            (kind, &payload),
            (MessageKind::Text, WirePayload::Text(_)) | (MessageKind::Binary, WirePayload::Binary(_))
        );
        if !matches {
            return Err(VoxlinkError::ProtocolViolation(format!(
                "{kind:?} frame constructed with a mismatched payload"
            )));
        }
        Ok(Self {
            kind,
            payload,
            id: id.unwrap_or_else(new_id),
        })
    }

    pub fn text(payload: impl Into<String>, id: Option<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: WirePayload::Text(payload.into()),
            id: id.unwrap_or_else(new_id),
        }
    }

    pub fn binary(payload: impl Into<Bytes>, id: Option<String>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: WirePayload::Binary(payload.into()),
            id: id.unwrap_or_else(new_id),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &WirePayload {
        &self.payload
    }

    pub fn into_payload(self) -> WirePayload {
        self.payload
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        match &self.payload {
            WirePayload::Text(s) => s.len(),
            WirePayload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// ISO-8601 UTC timestamp with millisecond precision, as the service expects
/// in `X-Timestamp`.
pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
