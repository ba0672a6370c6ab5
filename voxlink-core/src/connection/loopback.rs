//! In-memory `Transport` for tests and offline hosts.
//!
//! Every successful `open()` produces a `LoopbackPeer` on the paired
//! `LoopbackServer`, which plays the service side: it sees client frames and
//! can push frames or close the socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::transport::{
    FrameSink, FrameStream, HandshakeRequest, Transport, TransportEvent, TransportFailure,
    TransportHalves, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use crate::error::{Result, VoxlinkError};
use crate::message::RawWireMessage;

#[derive(Default)]
struct Behaviour {
    /// Failures returned by the next opens, oldest first.
    rejections: Vec<TransportFailure>,
    open_delay: Option<Duration>,
    requests: Vec<HandshakeRequest>,
}

#[derive(Clone)]
pub struct LoopbackTransport {
    behaviour: Arc<Mutex<Behaviour>>,
    peers: mpsc::UnboundedSender<LoopbackPeer>,
}

/// Service side of a `LoopbackTransport`.
pub struct LoopbackServer {
    peers: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackTransport {
    pub fn new() -> (Self, LoopbackServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                behaviour: Arc::new(Mutex::new(Behaviour::default())),
                peers: tx,
            },
            LoopbackServer { peers: rx },
        )
    }

    /// Fail the next `open()` with this status.
    pub fn reject_next(&self, status_code: u16, reason: &str) {
        self.behaviour.lock().rejections.push(TransportFailure {
            status_code,
            reason: reason.to_string(),
        });
    }

    /// Delay every handshake, to observe the `Connecting` state.
    pub fn set_open_delay(&self, delay: Duration) {
        self.behaviour.lock().open_delay = Some(delay);
    }

    /// Handshake requests seen so far.
    pub fn requests(&self) -> Vec<HandshakeRequest> {
        self.behaviour.lock().requests.clone()
    }
}

impl LoopbackServer {
    /// Next accepted client socket, or `None` once the transport is dropped.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.peers.recv().await
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        request: &HandshakeRequest,
    ) -> std::result::Result<TransportHalves, TransportFailure> {
        let (delay, rejection) = {
            let mut behaviour = self.behaviour.lock();
            behaviour.requests.push(request.clone());
            let rejection = if behaviour.rejections.is_empty() {
                None
            } else {
                Some(behaviour.rejections.remove(0))
            };
            (behaviour.open_delay, rejection)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = rejection {
            return Err(failure);
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        self.peers
            .send(LoopbackPeer {
                inbound: client_rx,
                outbound: server_tx,
            })
            .map_err(|_| TransportFailure::network("loopback server dropped"))?;

        Ok((
            Box::new(LoopbackSink { tx: Some(client_tx) }),
            Box::new(LoopbackStream { rx: server_rx }),
        ))
    }
}

/// One accepted socket, seen from the service side.
pub struct LoopbackPeer {
    inbound: mpsc::UnboundedReceiver<RawWireMessage>,
    outbound: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackPeer {
    /// Next frame written by the client, or `None` once it closed.
    pub async fn recv(&mut self) -> Option<RawWireMessage> {
        self.inbound.recv().await
    }

    pub fn send(&self, frame: RawWireMessage) -> bool {
        self.outbound.send(TransportEvent::Frame(frame)).is_ok()
    }

    pub fn close(&self, status_code: u16, reason: &str) {
        let _ = self.outbound.send(TransportEvent::Closed {
            status_code,
            reason: reason.to_string(),
        });
    }
}

struct LoopbackSink {
    tx: Option<mpsc::UnboundedSender<RawWireMessage>>,
}

#[async_trait]
impl FrameSink for LoopbackSink {
    async fn send(&mut self, frame: RawWireMessage) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(VoxlinkError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| VoxlinkError::ConnectionFailure {
            status_code: ABNORMAL_CLOSURE,
            reason: "loopback peer dropped".into(),
        })
    }

    async fn close(&mut self, _reason: &str) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct LoopbackStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl FrameStream for LoopbackStream {
    async fn next_event(&mut self) -> TransportEvent {
        self.rx.recv().await.unwrap_or(TransportEvent::Closed {
            status_code: ABNORMAL_CLOSURE,
            reason: "loopback peer dropped".into(),
        })
    }
}
