//! Lifecycle events for observability.
//!
//! There is no global listener. Callers build an `EventSink`, hand clones of
//! it to each `Connection` and `RequestSession`, and `subscribe()` where they
//! want to observe. Emitting never blocks: with no subscribers, or with a
//! lagging one, events are dropped rather than stalling protocol progress.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::CompletionReason;

/// Broadcast channel capacity: 256 events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Envelope shared by every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Monotonically increasing per-sink sequence number.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: PlatformEvent,
}

/// One variant per event kind, each carrying only the fields it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlatformEvent {
    #[serde(rename_all = "camelCase")]
    ConnectionStart { connection_id: String, uri: String },
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished { connection_id: String },
    #[serde(rename_all = "camelCase")]
    ConnectionEstablishError {
        connection_id: String,
        status_code: u16,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionClosed {
        connection_id: String,
        status_code: u16,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionMessageSent {
        connection_id: String,
        message_id: String,
        path: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionMessageReceived {
        connection_id: String,
        message_id: String,
        path: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionMessageDecodeError { connection_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    AudioSourceAttached {
        session_id: String,
        audio_node_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AudioSourceAttachFailed { session_id: String },
    #[serde(rename_all = "camelCase")]
    TurnStarted { session_id: String, request_id: String },
    #[serde(rename_all = "camelCase")]
    TurnEnded { session_id: String, request_id: String },
    #[serde(rename_all = "camelCase")]
    SessionCompleted {
        session_id: String,
        request_id: String,
        reason: CompletionReason,
    },
}

/// Cloneable handle onto one event stream.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EventEnvelope>,
    seq: Arc<AtomicU64>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: PlatformEvent) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(EventEnvelope {
            seq,
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(BROADCAST_CAP)
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
