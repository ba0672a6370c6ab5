//! `Connection`: one transport socket with its state machine and message framing.
//!
//! ## Lifecycle
//!
//! ```text
//! None ──open()──► Connecting ──ok──► Connected ──close / dispose()──► Disconnected
//!                      │                                                   ▲
//!                      └──────────────handshake failed─────────────────────┘
//! ```
//!
//! `Disconnected` is terminal once the socket had been connected or the
//! instance was disposed. After a failed handshake (socket never connected)
//! `open()` may be called again on the same instance.
//!
//! ## Threading
//!
//! A reader task owns the read half of the transport, decodes each frame with
//! the formatter, and queues the result for `read()`. Writes go through an
//! async mutex around the write half so concurrent `send()` calls never
//! interleave frames. Only `open()`, `dispose()`, and the reader task write
//! the state.

pub mod factory;
pub mod loopback;
pub mod transport;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, VoxlinkError},
    events::{EventSink, PlatformEvent},
    message::{header_names, ConnectionMessage, MessageFormatter},
};

pub use factory::ConnectionFactory;
pub use transport::{
    FrameSink, FrameStream, HandshakeRequest, Transport, TransportEvent, TransportFailure,
    WsTransport, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};

/// Status reported for a successful handshake.
pub const STATUS_OK: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    Disconnected,
}

/// Outcome of `open()`. A failed handshake is a response, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOpenResponse {
    pub status_code: u16,
    pub reason: String,
}

impl ConnectionOpenResponse {
    pub fn ok() -> Self {
        Self {
            status_code: STATUS_OK,
            reason: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }
}

impl From<TransportFailure> for ConnectionOpenResponse {
    fn from(failure: TransportFailure) -> Self {
        Self {
            status_code: failure.status_code,
            reason: failure.reason,
        }
    }
}

pub struct Connection {
    id: String,
    request: HandshakeRequest,
    transport: Arc<dyn Transport>,
    formatter: Arc<dyn MessageFormatter>,
    events: EventSink,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Set once the socket has been connected at least once.
    was_connected: AtomicBool,
    disposed: AtomicBool,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    /// Handed to the reader task on open; dropped on dispose.
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<ConnectionMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionMessage>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Build an unopened connection. `X-ConnectionId` is added to the handshake headers.
    pub fn new(
        connection_id: impl Into<String>,
        mut request: HandshakeRequest,
        transport: Arc<dyn Transport>,
        formatter: Arc<dyn MessageFormatter>,
        events: EventSink,
    ) -> Self {
        let id = connection_id.into();
        request.headers.insert(header_names::CONNECTION_ID, id.as_str());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::None);

        Self {
            id,
            request,
            transport,
            formatter,
            events,
            state: Arc::new(state),
            was_connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            sink: tokio::sync::Mutex::new(None),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            reader: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uri(&self) -> &url::Url {
        &self.request.uri
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Perform the handshake.
    ///
    /// # Errors
    /// - `VoxlinkError::InvalidState` while another open is in flight, after
    ///   dispose, or after the socket was closed.
    /// - `VoxlinkError::ConnectionClosed` if disposed while the handshake ran.
    pub async fn open(&self) -> Result<ConnectionOpenResponse> {
        let mut transition = Ok(());
        let mut already_open = false;
        self.state.send_if_modified(|state| {
            if self.disposed.load(Ordering::SeqCst) {
                transition = Err(VoxlinkError::InvalidState("connection disposed".into()));
                return false;
            }
            match *state {
                ConnectionState::Connecting => {
                    transition = Err(VoxlinkError::InvalidState("open already in progress".into()));
                    false
                }
                ConnectionState::Connected => {
                    already_open = true;
                    false
                }
                ConnectionState::Disconnected if self.was_connected.load(Ordering::SeqCst) => {
                    transition = Err(VoxlinkError::InvalidState(
                        "connection closed; create a new connection".into(),
                    ));
                    false
                }
                ConnectionState::None | ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                    true
                }
            }
        });
        transition?;
        if already_open {
            return Ok(ConnectionOpenResponse::ok());
        }

        info!(connection_id = self.id.as_str(), uri = %self.request.uri, "opening connection");
        self.events.emit(PlatformEvent::ConnectionStart {
            connection_id: self.id.clone(),
            uri: self.request.uri.to_string(),
        });

        let (sink, stream) = match self.transport.open(&self.request).await {
            Ok(halves) => halves,
            Err(failure) => {
                warn!(
                    connection_id = self.id.as_str(),
                    status_code = failure.status_code,
                    reason = failure.reason.as_str(),
                    "connection establish failed"
                );
                self.state.send_replace(ConnectionState::Disconnected);
                self.events.emit(PlatformEvent::ConnectionEstablishError {
                    connection_id: self.id.clone(),
                    status_code: failure.status_code,
                    reason: failure.reason.clone(),
                });
                return Ok(failure.into());
            }
        };

        // `dispose` takes the sink slot before releasing anything, so holding it
        // here makes the Connected transition and the reader spawn one step.
        let mut slot = self.sink.lock().await;
        let inbound_tx = self.inbound_tx.lock().clone();
        let promoted = inbound_tx.is_some()
            && self.state.send_if_modified(|state| {
                if self.disposed.load(Ordering::SeqCst) || *state != ConnectionState::Connecting {
                    return false;
                }
                *state = ConnectionState::Connected;
                true
            });
        let Some(inbound_tx) = inbound_tx.filter(|_| promoted) else {
            drop(slot);
            let mut sink = sink;
            if let Err(e) = sink.close("disposed during open").await {
                debug!(connection_id = self.id.as_str(), "close after aborted open failed: {e}");
            }
            return Err(VoxlinkError::ConnectionClosed);
        };

        *slot = Some(sink);
        self.was_connected.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(ReaderContext {
            connection_id: self.id.clone(),
            stream,
            formatter: Arc::clone(&self.formatter),
            inbound_tx,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        }));
        *self.reader.lock() = Some(reader);
        // The reader holds the only live sender now.
        drop(self.inbound_tx.lock().take());
        drop(slot);

        info!(connection_id = self.id.as_str(), "connection established");
        self.events.emit(PlatformEvent::ConnectionEstablished {
            connection_id: self.id.clone(),
        });
        Ok(ConnectionOpenResponse::ok())
    }

    /// Encode and write one message.
    ///
    /// # Errors
    /// - `VoxlinkError::NotConnected` unless the state is `Connected`.
    /// - `VoxlinkError::MalformedMessage` if the formatter cannot encode it.
    /// - `VoxlinkError::ConnectionFailure` if the transport write fails.
    pub async fn send(&self, message: ConnectionMessage) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(VoxlinkError::NotConnected);
        }
        let frame = self.formatter.from_connection_message(&message)?;

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(VoxlinkError::NotConnected);
        };
        sink.send(frame).await?;
        drop(guard);

        self.events.emit(PlatformEvent::ConnectionMessageSent {
            connection_id: self.id.clone(),
            message_id: message.id().to_string(),
            path: message.path().map(str::to_string),
        });
        Ok(())
    }

    /// Next decoded inbound message.
    ///
    /// # Errors
    /// - `VoxlinkError::NotConnected` before `open()` was called.
    /// - `VoxlinkError::ConnectionClosed` once the transport has ended, on every
    ///   call after that.
    pub async fn read(&self) -> Result<ConnectionMessage> {
        let mut rx = self.inbound_rx.lock().await;
        if let Ok(message) = rx.try_recv() {
            return Ok(message);
        }

        let mut state = self.state.subscribe();
        match *state.borrow_and_update() {
            ConnectionState::None => return Err(VoxlinkError::NotConnected),
            ConnectionState::Disconnected => return Err(VoxlinkError::ConnectionClosed),
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }

        tokio::select! {
            biased;
            message = rx.recv() => message.ok_or(VoxlinkError::ConnectionClosed),
            _ = state.wait_for(|s| *s == ConnectionState::Disconnected) => {
                rx.try_recv().map_err(|_| VoxlinkError::ConnectionClosed)
            }
        }
    }

    /// Close the socket and release everything. Safe to call repeatedly.
    pub async fn dispose(&self, reason: Option<&str>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.unwrap_or("disposed");
        let previous = self.state.send_replace(ConnectionState::Disconnected);

        // Waits for an in-flight write, or an open finishing its handshake,
        // rather than cutting it.
        let sink = self.sink.lock().await.take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        drop(self.inbound_tx.lock().take());

        if let Some(mut sink) = sink {
            if let Err(e) = sink.close(reason).await {
                debug!(connection_id = self.id.as_str(), "close on dispose failed: {e}");
            }
        }

        if previous != ConnectionState::Disconnected {
            info!(connection_id = self.id.as_str(), reason, "connection disposed");
            self.events.emit(PlatformEvent::ConnectionClosed {
                connection_id: self.id.clone(),
                status_code: NORMAL_CLOSURE,
                reason: reason.to_string(),
            });
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("uri", &self.request.uri.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct ReaderContext {
    connection_id: String,
    stream: Box<dyn FrameStream>,
    formatter: Arc<dyn MessageFormatter>,
    inbound_tx: mpsc::UnboundedSender<ConnectionMessage>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: EventSink,
}

async fn read_loop(mut ctx: ReaderContext) {
    loop {
        match ctx.stream.next_event().await {
            TransportEvent::Frame(raw) => match ctx.formatter.to_connection_message(raw) {
                Ok(message) => {
                    ctx.events.emit(PlatformEvent::ConnectionMessageReceived {
                        connection_id: ctx.connection_id.clone(),
                        message_id: message.id().to_string(),
                        path: message.path().map(str::to_string),
                    });
                    if ctx.inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(connection_id = ctx.connection_id.as_str(), "dropping undecodable frame: {e}");
                    ctx.events.emit(PlatformEvent::ConnectionMessageDecodeError {
                        connection_id: ctx.connection_id.clone(),
                        reason: e.to_string(),
                    });
                }
            },
            TransportEvent::Closed {
                status_code,
                reason,
            } => {
                info!(
                    connection_id = ctx.connection_id.as_str(),
                    status_code,
                    reason = reason.as_str(),
                    "transport closed"
                );
                let previous = ctx.state.send_replace(ConnectionState::Disconnected);
                if previous != ConnectionState::Disconnected {
                    ctx.events.emit(PlatformEvent::ConnectionClosed {
                        connection_id: ctx.connection_id.clone(),
                        status_code,
                        reason,
                    });
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::loopback::{LoopbackServer, LoopbackTransport};
    use crate::message::{Headers, RawWireMessage, SpeechMessageFormatter};
    use std::time::Duration;
    use url::Url;

    fn connection(transport: LoopbackTransport) -> Connection {
        let request = HandshakeRequest {
            uri: Url::parse("wss://loopback.test/speech/recognition").expect("url"),
            headers: Headers::new().with("Ocp-Apim-Subscription-Key", "key"),
        };
        Connection::new(
            "conn1",
            request,
            Arc::new(transport),
            Arc::new(SpeechMessageFormatter),
            EventSink::default(),
        )
    }

    fn pair() -> (Connection, LoopbackTransport, LoopbackServer) {
        let (transport, server) = LoopbackTransport::new();
        (connection(transport.clone()), transport, server)
    }

    #[tokio::test]
    async fn send_before_open_is_not_connected() {
        let (conn, _transport, _server) = pair();
        assert_eq!(conn.state(), ConnectionState::None);
        let msg = ConnectionMessage::speech_text("speech.config", "r1", "application/json", "{}");
        assert!(matches!(conn.send(msg).await, Err(VoxlinkError::NotConnected)));
        assert!(matches!(conn.read().await, Err(VoxlinkError::NotConnected)));
    }

    #[tokio::test]
    async fn open_send_read_dispose_walks_the_state_machine() {
        let (conn, transport, mut server) = pair();

        let response = conn.open().await.expect("open");
        assert!(response.is_success());
        assert_eq!(conn.state(), ConnectionState::Connected);

        let handshake = &transport.requests()[0];
        assert_eq!(handshake.headers.get("x-connectionid"), Some("conn1"));

        let mut peer = server.accept().await.expect("peer");
        let msg = ConnectionMessage::speech_text("speech.config", "r1", "application/json", "{}");
        conn.send(msg).await.expect("send");
        let frame = peer.recv().await.expect("client frame");
        let decoded = SpeechMessageFormatter
            .to_connection_message(frame)
            .expect("decode");
        assert_eq!(decoded.path(), Some("speech.config"));

        let reply = ConnectionMessage::speech_text("turn.start", "r1", "application/json", "{}");
        peer.send(
            SpeechMessageFormatter
                .from_connection_message(&reply)
                .expect("encode"),
        );
        let inbound = conn.read().await.expect("read");
        assert_eq!(inbound.path(), Some("turn.start"));

        conn.dispose(Some("done")).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(peer.recv().await.is_none());
        assert!(matches!(
            conn.send(reply).await,
            Err(VoxlinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn open_on_connected_returns_cached_success() {
        let (conn, transport, _server) = pair();
        conn.open().await.expect("first open");
        let again = conn.open().await.expect("second open");
        assert!(again.is_success());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_open_is_invalid_state() {
        let (conn, transport, _server) = pair();
        transport.set_open_delay(Duration::from_millis(50));
        let conn = Arc::new(conn);

        let first = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.open().await }
        });
        let mut state = conn.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .expect("connecting");

        assert!(matches!(conn.open().await, Err(VoxlinkError::InvalidState(_))));
        assert!(first.await.expect("join").expect("open").is_success());
    }

    #[tokio::test]
    async fn rejected_handshake_reports_status_and_allows_retry() {
        let (conn, transport, _server) = pair();
        transport.reject_next(403, "Forbidden");

        let response = conn.open().await.expect("open resolves");
        assert_eq!(response.status_code, 403);
        assert!(!response.is_success());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let retry = conn.open().await.expect("retry");
        assert!(retry.is_success());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn dispose_unblocks_pending_read() {
        let (conn, _transport, _server) = pair();
        conn.open().await.expect("open");
        let conn = Arc::new(conn);

        let reader = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.read().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.dispose(None).await;
        conn.dispose(None).await;

        let outcome = reader.await.expect("join");
        assert!(matches!(outcome, Err(VoxlinkError::ConnectionClosed)));
        assert!(matches!(conn.read().await, Err(VoxlinkError::ConnectionClosed)));
        assert!(matches!(conn.open().await, Err(VoxlinkError::InvalidState(_))));
    }

    #[tokio::test]
    async fn dispose_during_handshake_leaves_the_socket_closed() {
        let (conn, transport, mut server) = pair();
        transport.set_open_delay(Duration::from_millis(30));
        let conn = Arc::new(conn);

        let opening = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.open().await }
        });
        conn.watch_state()
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .expect("connecting");
        conn.dispose(Some("shutting down")).await;

        let outcome = opening.await.expect("join");
        assert!(matches!(outcome, Err(VoxlinkError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let mut peer = server.accept().await.expect("peer");
        assert!(peer.recv().await.is_none());
        assert!(matches!(conn.open().await, Err(VoxlinkError::InvalidState(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_arrive_whole_and_in_per_sender_order() {
        const SENDERS: usize = 8;
        const PER_SENDER: usize = 25;

        let (conn, _transport, mut server) = pair();
        conn.open().await.expect("open");
        let conn = Arc::new(conn);
        let mut peer = server.accept().await.expect("peer");

        let tasks: Vec<_> = (0..SENDERS)
            .map(|sender| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    for seq in 0..PER_SENDER {
                        let body = format!("{{\"sender\":{sender},\"seq\":{seq}}}");
                        let msg = ConnectionMessage::speech_text(
                            "speech.event",
                            &format!("sender{sender}"),
                            "application/json",
                            body,
                        );
                        conn.send(msg).await.expect("send");
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join");
        }

        let mut next_seq = [0usize; SENDERS];
        for _ in 0..SENDERS * PER_SENDER {
            let frame = peer.recv().await.expect("frame");
            let message = SpeechMessageFormatter
                .to_connection_message(frame)
                .expect("intact frame");
            let body: serde_json::Value =
                serde_json::from_str(message.text_body().expect("text")).expect("json body");
            let sender = body["sender"].as_u64().expect("sender") as usize;
            let seq = body["seq"].as_u64().expect("seq") as usize;
            assert_eq!(message.request_id(), Some(format!("sender{sender}").as_str()));
            assert_eq!(seq, next_seq[sender]);
            next_seq[sender] += 1;
        }
        assert!(next_seq.iter().all(|&n| n == PER_SENDER));
    }

    #[tokio::test]
    async fn remote_close_is_terminal_after_buffered_frames() {
        let (conn, _transport, mut server) = pair();
        let events = conn.events.clone();
        let mut rx = events.subscribe();
        conn.open().await.expect("open");
        let peer = server.accept().await.expect("peer");

        let msg = ConnectionMessage::speech_text("speech.phrase", "r1", "application/json", "{}");
        peer.send(SpeechMessageFormatter.from_connection_message(&msg).expect("encode"));
        peer.send(RawWireMessage::text("no header terminator", None));
        peer.close(NORMAL_CLOSURE, "service done");

        assert_eq!(conn.read().await.expect("buffered").path(), Some("speech.phrase"));
        assert!(matches!(conn.read().await, Err(VoxlinkError::ConnectionClosed)));
        assert!(matches!(conn.read().await, Err(VoxlinkError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.open().await, Err(VoxlinkError::InvalidState(_))));

        let mut saw_decode_error = false;
        let mut saw_closed = false;
        while let Ok(envelope) = rx.try_recv() {
            match envelope.event {
                PlatformEvent::ConnectionMessageDecodeError { .. } => saw_decode_error = true,
                PlatformEvent::ConnectionClosed { status_code, .. } => {
                    assert_eq!(status_code, NORMAL_CLOSURE);
                    saw_closed = true;
                }
                _ => {}
            }
        }
        assert!(saw_decode_error);
        assert!(saw_closed);
    }
}
