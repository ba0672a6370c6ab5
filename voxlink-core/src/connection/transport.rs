//! Transport boundary and the default WebSocket implementation.
//!
//! A `Transport` performs the handshake and hands back two independent halves:
//! a `FrameSink` for writes and a `FrameStream` for reads, so the connection
//! can read and write concurrently.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{Result, VoxlinkError};
use crate::message::{Headers, RawWireMessage, WirePayload};

/// Close code reported when the socket dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code for an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed for the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub uri: Url,
    pub headers: Headers,
}

/// Why a handshake did not produce an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// HTTP status of a rejected upgrade, or `ABNORMAL_CLOSURE` for network errors.
    pub status_code: u16,
    pub reason: String,
}

impl TransportFailure {
    pub fn network(reason: impl Into<String>) -> Self {
        Self {
            status_code: ABNORMAL_CLOSURE,
            reason: reason.into(),
        }
    }
}

/// What the read half yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(RawWireMessage),
    /// Terminal. No frames follow.
    Closed { status_code: u16, reason: String },
}

pub type TransportHalves = (Box<dyn FrameSink>, Box<dyn FrameStream>);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &HandshakeRequest)
        -> std::result::Result<TransportHalves, TransportFailure>;
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: RawWireMessage) -> Result<()>;
    async fn close(&mut self, reason: &str) -> Result<()>;
}

#[async_trait]
pub trait FrameStream: Send {
    async fn next_event(&mut self) -> TransportEvent;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite
// ---------------------------------------------------------------------------

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        request: &HandshakeRequest,
    ) -> std::result::Result<TransportHalves, TransportFailure> {
        let mut upgrade = request
            .uri
            .as_str()
            .into_client_request()
            .map_err(|e| TransportFailure::network(format!("invalid request: {e}")))?;

        for (name, value) in request.headers.iter() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportFailure::network(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportFailure::network(format!("header value for '{name}': {e}")))?;
            upgrade.headers_mut().insert(name, value);
        }

        match connect_async(upgrade).await {
            Ok((socket, response)) => {
                debug!(status = response.status().as_u16(), "websocket upgraded");
                let (sink, stream) = socket.split();
                Ok((Box::new(WsFrameSink { sink }), Box::new(WsFrameStream { stream })))
            }
            Err(WsError::Http(response)) => {
                let status = response.status();
                Err(TransportFailure {
                    status_code: status.as_u16(),
                    reason: status
                        .canonical_reason()
                        .unwrap_or("handshake rejected")
                        .to_string(),
                })
            }
            Err(e) => Err(TransportFailure::network(e.to_string())),
        }
    }
}

struct WsFrameSink {
    sink: SplitSink<WsSocket, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: RawWireMessage) -> Result<()> {
        let message = match frame.into_payload() {
            WirePayload::Text(text) => Message::Text(text.into()),
            WirePayload::Binary(bytes) => Message::Binary(bytes),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| VoxlinkError::ConnectionFailure {
                status_code: ABNORMAL_CLOSURE,
                reason: e.to_string(),
            })
    }

    async fn close(&mut self, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        self.sink
            .close()
            .await
            .map_err(|e| VoxlinkError::ConnectionFailure {
                status_code: ABNORMAL_CLOSURE,
                reason: e.to_string(),
            })
    }
}

struct WsFrameStream {
    stream: SplitStream<WsSocket>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Frame(RawWireMessage::text(text.as_str(), None))
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return TransportEvent::Frame(RawWireMessage::binary(bytes, None))
                }
                Some(Ok(Message::Close(frame))) => {
                    let (status_code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((NORMAL_CLOSURE, String::new()));
                    return TransportEvent::Closed { status_code, reason };
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return TransportEvent::Closed {
                        status_code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                    }
                }
                None => {
                    return TransportEvent::Closed {
                        status_code: ABNORMAL_CLOSURE,
                        reason: "stream ended".into(),
                    }
                }
            }
        }
    }
}
