//! Per-request bookkeeping for one recognition run on a connection.
//!
//! ## Turn state machine
//!
//! ```text
//! Idle ─pre_connection_start─► AuthPending ─auth ok─► Connecting ─200─► Active
//!                                   │                     │               │
//!                                auth error              403       turn.end (single shot)
//!                                   ▼                     ▼               ▼
//!                                Completed ◄──────────────┴───────────────┘
//! ```
//!
//! A continuous turn end rotates the request id and stays `Active`.
//! Completion fires exactly once whichever path reaches it first; failures
//! are carried in the `CompletionReason`, never raised.

pub mod conversation;
pub mod pump;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::deferral::Deferred;
use crate::error::{Result, VoxlinkError};
use crate::events::{EventSink, PlatformEvent};
use crate::message::new_id;

pub use conversation::ConversationCommands;
pub use pump::pump_audio;

const STATUS_OK: u16 = 200;
const STATUS_FORBIDDEN: u16 = 403;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnState {
    Idle,
    AuthPending,
    Connecting,
    Active,
    Completed,
}

/// Why a session completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionReason {
    /// A single-shot turn ended normally.
    TurnEnded,
    AuthFetchFailed,
    #[serde(rename_all = "camelCase")]
    AuthRejected { status_code: u16 },
    AudioSourceFailed,
    /// The caller stopped recognition.
    Stopped,
    /// Disposed before any other completion.
    Disposed,
}

impl CompletionReason {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CompletionReason::AuthFetchFailed
                | CompletionReason::AuthRejected { .. }
                | CompletionReason::AudioSourceFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCompletion {
    pub session_id: String,
    pub request_id: String,
    pub reason: CompletionReason,
}

/// A resource owned by a session and released when the session is disposed.
#[async_trait]
pub trait Detachable: Send + Sync {
    fn id(&self) -> &str;

    async fn detach(&self) -> Result<()>;
}

/// Called once when a session completes.
pub trait CompletionHook: Send + Sync {
    fn on_complete(&self, completion: &TurnCompletion);
}

/// Hook that does nothing. Conversation sessions use it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl CompletionHook for NoopHook {
    fn on_complete(&self, _completion: &TurnCompletion) {}
}

/// Point-in-time view of a session's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTelemetry {
    pub session_id: String,
    pub request_id: String,
    pub auth_fetch_event_id: String,
    pub audio_node_id: Option<String>,
    pub state: TurnState,
    pub in_turn: bool,
    pub is_speech_ended: bool,
    pub is_recognizing: bool,
    pub hypothesis_received: bool,
    pub recognition_number: u32,
    pub connection_attempts: u32,
    pub bytes_sent_connection: u64,
    pub bytes_sent_recognition: u64,
    pub turn_start_offset: u64,
    pub last_result_offset: u64,
}

struct SessionState {
    session_id: String,
    request_id: String,
    auth_fetch_event_id: String,
    audio_node_id: Option<String>,
    state: TurnState,
    in_turn: bool,
    is_speech_ended: bool,
    is_recognizing: bool,
    hypothesis_received: bool,
    recognition_number: u32,
    connection_attempts: u32,
    bytes_sent_connection: u64,
    bytes_sent_recognition: u64,
    turn_start_offset: u64,
    last_result_offset: u64,
}

pub struct RequestSession {
    state: Mutex<SessionState>,
    detachables: Mutex<Vec<Arc<dyn Detachable>>>,
    completion: Deferred<TurnCompletion>,
    hook: Arc<dyn CompletionHook>,
    events: EventSink,
    disposing: AtomicBool,
    disposed: AtomicBool,
}

impl RequestSession {
    pub fn new(events: EventSink) -> Self {
        Self::with_hook(events, Arc::new(NoopHook))
    }

    pub fn with_hook(events: EventSink, hook: Arc<dyn CompletionHook>) -> Self {
        let request_id = new_id();
        Self {
            state: Mutex::new(SessionState {
                session_id: request_id.clone(),
                request_id,
                auth_fetch_event_id: new_id(),
                audio_node_id: None,
                state: TurnState::Idle,
                in_turn: false,
                is_speech_ended: false,
                is_recognizing: true,
                hypothesis_received: false,
                recognition_number: 0,
                connection_attempts: 0,
                bytes_sent_connection: 0,
                bytes_sent_recognition: 0,
                turn_start_offset: 0,
                last_result_offset: 0,
            }),
            detachables: Mutex::new(Vec::new()),
            completion: Deferred::new(),
            hook,
            events,
            disposing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    pub fn request_id(&self) -> String {
        self.state.lock().request_id.clone()
    }

    pub fn auth_fetch_event_id(&self) -> String {
        self.state.lock().auth_fetch_event_id.clone()
    }

    pub fn audio_node_id(&self) -> Option<String> {
        self.state.lock().audio_node_id.clone()
    }

    pub fn turn_state(&self) -> TurnState {
        self.state.lock().state
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_settled()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_speech_ended(&self) -> bool {
        self.state.lock().is_speech_ended
    }

    pub fn is_recognizing(&self) -> bool {
        self.state.lock().is_recognizing
    }

    pub fn telemetry(&self) -> SessionTelemetry {
        let s = self.state.lock();
        SessionTelemetry {
            session_id: s.session_id.clone(),
            request_id: s.request_id.clone(),
            auth_fetch_event_id: s.auth_fetch_event_id.clone(),
            audio_node_id: s.audio_node_id.clone(),
            state: s.state,
            in_turn: s.in_turn,
            is_speech_ended: s.is_speech_ended,
            is_recognizing: s.is_recognizing,
            hypothesis_received: s.hypothesis_received,
            recognition_number: s.recognition_number,
            connection_attempts: s.connection_attempts,
            bytes_sent_connection: s.bytes_sent_connection,
            bytes_sent_recognition: s.bytes_sent_recognition,
            turn_start_offset: s.turn_start_offset,
            last_result_offset: s.last_result_offset,
        }
    }

    /// Own `resource` until dispose.
    ///
    /// # Errors
    /// `VoxlinkError::InvalidState` once dispose has started.
    pub fn register_detachable(&self, resource: Arc<dyn Detachable>) -> Result<()> {
        let mut detachables = self.detachables.lock();
        if self.disposing.load(Ordering::SeqCst) {
            return Err(VoxlinkError::InvalidState("session is disposed".into()));
        }
        detachables.push(resource);
        Ok(())
    }

    /// Wait for the session to complete. Race it against a timer for a timeout.
    pub async fn completion(&self) -> Result<TurnCompletion> {
        self.completion.wait().await
    }

    /// Handle onto the completion, for waiting without borrowing the session.
    pub fn completion_handle(&self) -> Deferred<TurnCompletion> {
        self.completion.clone()
    }

    // ── Lifecycle callbacks ──────────────────────────────────────────────────

    /// Take ownership of the attached audio node. A node arriving after
    /// dispose has started is detached straight away.
    pub async fn on_audio_source_attach_completed(&self, node: Arc<dyn Detachable>, is_error: bool) {
        let session_id = self.session_id();
        if is_error {
            warn!(session_id = session_id.as_str(), "audio source attach failed");
            self.events
                .emit(PlatformEvent::AudioSourceAttachFailed { session_id });
            self.complete(CompletionReason::AudioSourceFailed);
            return;
        }

        let node_id = node.id().to_string();
        if let Err(e) = self.register_detachable(Arc::clone(&node)) {
            warn!(session_id = session_id.as_str(), "audio node attached after dispose: {e}");
            if let Err(e) = node.detach().await {
                warn!(node_id = node_id.as_str(), "audio node detach failed: {e}");
            }
            return;
        }
        self.state.lock().audio_node_id = Some(node_id.clone());
        self.events.emit(PlatformEvent::AudioSourceAttached {
            session_id,
            audio_node_id: node_id,
        });
    }

    /// The connection id becomes the session id for the rest of the run.
    pub fn on_pre_connection_start(&self, auth_fetch_event_id: &str, connection_id: &str) {
        let mut s = self.state.lock();
        s.auth_fetch_event_id = auth_fetch_event_id.to_string();
        s.session_id = connection_id.to_string();
        s.connection_attempts += 1;
        s.bytes_sent_connection = 0;
        if s.state != TurnState::Completed {
            s.state = TurnState::AuthPending;
        }
        debug!(session_id = connection_id, attempt = s.connection_attempts, "connection starting");
    }

    pub fn on_auth_completed(&self, is_error: bool) {
        if is_error {
            self.complete(CompletionReason::AuthFetchFailed);
            return;
        }
        let mut s = self.state.lock();
        if s.state == TurnState::AuthPending {
            s.state = TurnState::Connecting;
        }
    }

    /// 200 keeps the turn going, 403 completes it. Other codes are the
    /// caller's to handle (typically a retry).
    pub fn on_connection_establish_completed(&self, status_code: u16) {
        match status_code {
            STATUS_OK => {
                let mut s = self.state.lock();
                if s.state != TurnState::Completed {
                    s.state = TurnState::Active;
                }
            }
            STATUS_FORBIDDEN => self.complete(CompletionReason::AuthRejected { status_code }),
            other => debug!(status_code = other, "connection establish status left to caller"),
        }
    }

    pub fn on_service_turn_start_response(&self) {
        let (session_id, request_id) = {
            let mut s = self.state.lock();
            s.in_turn = true;
            (s.session_id.clone(), s.request_id.clone())
        };
        self.events.emit(PlatformEvent::TurnStarted {
            session_id,
            request_id,
        });
    }

    /// `continuous`: rotate the request id and stay active. Otherwise complete.
    /// Ignored once the session has completed.
    pub fn on_service_turn_end_response(&self, continuous: bool) {
        let (session_id, ended_request_id) = {
            let mut s = self.state.lock();
            if s.state == TurnState::Completed {
                debug!(session_id = s.session_id.as_str(), "turn end after completion ignored");
                return;
            }
            s.in_turn = false;
            let ended = (s.session_id.clone(), s.request_id.clone());
            if continuous {
                s.request_id = new_id();
                s.recognition_number += 1;
                s.turn_start_offset = s.last_result_offset;
                s.bytes_sent_recognition = 0;
                s.hypothesis_received = false;
                s.is_speech_ended = false;
                s.state = TurnState::Active;
            }
            ended
        };
        self.events.emit(PlatformEvent::TurnEnded {
            session_id,
            request_id: ended_request_id,
        });
        if !continuous {
            self.complete(CompletionReason::TurnEnded);
        }
    }

    pub fn on_hypothesis(&self, offset: u64) {
        let mut s = self.state.lock();
        s.hypothesis_received = true;
        s.last_result_offset = offset;
    }

    pub fn on_phrase_recognized(&self, offset: u64) {
        let mut s = self.state.lock();
        s.last_result_offset = offset;
        s.hypothesis_received = false;
    }

    pub fn on_service_recognized(&self, offset: u64) {
        let mut s = self.state.lock();
        s.last_result_offset = offset;
        s.recognition_number += 1;
        s.hypothesis_received = false;
    }

    pub fn on_audio_sent(&self, bytes: usize) {
        let mut s = self.state.lock();
        s.bytes_sent_connection += bytes as u64;
        s.bytes_sent_recognition += bytes as u64;
    }

    /// A fresh connection replaces the failed one; per-connection counters reset.
    pub fn on_retry_connection(&self) {
        let mut s = self.state.lock();
        s.bytes_sent_connection = 0;
        s.in_turn = false;
        if s.state != TurnState::Completed {
            s.state = TurnState::AuthPending;
        }
    }

    pub fn on_speech_ended(&self) {
        self.state.lock().is_speech_ended = true;
    }

    /// Detach the audio node (if any) and complete with `Stopped`.
    pub async fn on_stop_recognizing(&self) {
        let node = {
            let mut s = self.state.lock();
            s.is_recognizing = false;
            s.audio_node_id.take()
        };
        if let Some(node_id) = node {
            let detached = {
                let mut detachables = self.detachables.lock();
                detachables
                    .iter()
                    .position(|d| d.id() == node_id)
                    .map(|idx| detachables.remove(idx))
            };
            if let Some(node) = detached {
                if let Err(e) = node.detach().await {
                    warn!(node_id = node_id.as_str(), "audio node detach failed: {e}");
                }
            }
        }
        self.complete(CompletionReason::Stopped);
    }

    /// Release every detachable exactly once, then mark disposed. Completes
    /// the session with `Disposed` if nothing else did.
    pub async fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        let owned = std::mem::take(&mut *self.detachables.lock());
        for resource in owned {
            if let Err(e) = resource.detach().await {
                warn!(resource = resource.id(), "detach failed during dispose: {e}");
            }
        }
        self.complete(CompletionReason::Disposed);
        self.disposed.store(true, Ordering::SeqCst);
        debug!(session_id = self.session_id().as_str(), "session disposed");
    }

    fn complete(&self, reason: CompletionReason) {
        let completion = {
            let mut s = self.state.lock();
            if s.state == TurnState::Completed {
                return;
            }
            s.state = TurnState::Completed;
            s.in_turn = false;
            TurnCompletion {
                session_id: s.session_id.clone(),
                request_id: s.request_id.clone(),
                reason,
            }
        };

        if completion.reason.is_error() {
            warn!(
                session_id = completion.session_id.as_str(),
                reason = ?completion.reason,
                "session completed with error"
            );
        } else {
            info!(
                session_id = completion.session_id.as_str(),
                reason = ?completion.reason,
                "session completed"
            );
        }

        // The state transition above makes this the only resolve.
        let _ = self.completion.resolve(completion.clone());
        self.hook.on_complete(&completion);
        self.events.emit(PlatformEvent::SessionCompleted {
            session_id: completion.session_id,
            request_id: completion.request_id,
            reason: completion.reason,
        });
    }
}

impl std::fmt::Debug for RequestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("RequestSession")
            .field("session_id", &s.session_id)
            .field("request_id", &s.request_id)
            .field("state", &s.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingResource {
        detaches: AtomicUsize,
    }

    #[async_trait]
    impl Detachable for CountingResource {
        fn id(&self) -> &str {
            "counting"
        }

        async fn detach(&self) -> Result<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: AtomicUsize,
    }

    impl CompletionHook for RecordingHook {
        fn on_complete(&self, _completion: &TurnCompletion) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connected_session() -> RequestSession {
        let session = RequestSession::new(EventSink::default());
        session.on_pre_connection_start("auth-1", "conn-1");
        session.on_auth_completed(false);
        session.on_connection_establish_completed(200);
        session
    }

    #[tokio::test]
    async fn single_shot_turn_end_completes_with_unchanged_request_id() {
        let session = connected_session();
        assert_eq!(session.turn_state(), TurnState::Active);
        assert_eq!(session.session_id(), "conn-1");
        let request_id = session.request_id();

        session.on_service_turn_start_response();
        session.on_service_turn_end_response(false);

        let done = session.completion().await.expect("completion");
        assert_eq!(done.request_id, request_id);
        assert_eq!(done.reason, CompletionReason::TurnEnded);
        assert_eq!(session.request_id(), request_id);
        assert_eq!(session.turn_state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn continuous_turns_rotate_request_ids() {
        let session = connected_session();
        let mut ids = vec![session.request_id()];
        for _ in 0..3 {
            session.on_service_turn_start_response();
            session.on_service_turn_end_response(true);
            ids.push(session.request_id());
        }

        let distinct: HashSet<_> = ids.iter().collect();
        assert_eq!(distinct.len(), ids.len());
        assert!(!session.is_completed());
        assert_eq!(session.turn_state(), TurnState::Active);
        assert_eq!(session.telemetry().recognition_number, 3);
    }

    #[tokio::test]
    async fn forbidden_completes_once() {
        let hook = Arc::new(RecordingHook::default());
        let session = RequestSession::with_hook(EventSink::default(), hook.clone());
        let mut events = session.events.subscribe();
        session.on_pre_connection_start("auth-1", "conn-1");
        session.on_auth_completed(false);

        session.on_connection_establish_completed(403);
        session.on_connection_establish_completed(403);

        let done = session.completion().await.expect("completion");
        assert_eq!(done.reason, CompletionReason::AuthRejected { status_code: 403 });
        assert!(done.reason.is_error());
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        let completions = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e.event, PlatformEvent::SessionCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn other_establish_codes_leave_the_session_open() {
        let session = RequestSession::new(EventSink::default());
        session.on_pre_connection_start("auth-1", "conn-1");
        session.on_auth_completed(false);
        session.on_connection_establish_completed(500);
        assert_eq!(session.turn_state(), TurnState::Connecting);
        assert!(!session.is_completed());

        session.on_retry_connection();
        session.on_pre_connection_start("auth-2", "conn-2");
        assert_eq!(session.telemetry().connection_attempts, 2);
        assert_eq!(session.session_id(), "conn-2");
    }

    #[tokio::test]
    async fn auth_failure_completes_with_reason() {
        let session = RequestSession::new(EventSink::default());
        session.on_pre_connection_start("auth-1", "conn-1");
        session.on_auth_completed(true);
        let done = session.completion().await.expect("completion");
        assert_eq!(done.reason, CompletionReason::AuthFetchFailed);
    }

    #[tokio::test]
    async fn dispose_detaches_each_resource_exactly_once() {
        let session = connected_session();
        let first = Arc::new(CountingResource::default());
        let second = Arc::new(CountingResource::default());
        session.register_detachable(first.clone()).expect("register");
        session.register_detachable(second.clone()).expect("register");

        session.dispose().await;
        session.dispose().await;

        assert_eq!(first.detaches.load(Ordering::SeqCst), 1);
        assert_eq!(second.detaches.load(Ordering::SeqCst), 1);
        assert!(session.is_disposed());
        assert_eq!(
            session.completion().await.expect("completion").reason,
            CompletionReason::Disposed
        );
        assert!(matches!(
            session.register_detachable(Arc::new(CountingResource::default())),
            Err(VoxlinkError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn dispose_after_completion_keeps_the_original_reason() {
        let session = connected_session();
        session.on_service_turn_end_response(false);
        session.dispose().await;
        assert_eq!(
            session.completion().await.expect("completion").reason,
            CompletionReason::TurnEnded
        );
    }

    #[tokio::test]
    async fn stop_recognizing_detaches_the_audio_node_once() {
        let session = connected_session();
        let node = Arc::new(CountingResource::default());
        session.on_audio_source_attach_completed(node.clone(), false).await;
        assert_eq!(session.audio_node_id().as_deref(), Some("counting"));

        session.on_stop_recognizing().await;
        session.dispose().await;

        assert_eq!(node.detaches.load(Ordering::SeqCst), 1);
        assert!(!session.is_recognizing());
        assert_eq!(
            session.completion().await.expect("completion").reason,
            CompletionReason::Stopped
        );
    }

    #[tokio::test]
    async fn audio_attach_failure_completes_the_session() {
        let session = connected_session();
        session
            .on_audio_source_attach_completed(Arc::new(CountingResource::default()), true)
            .await;
        assert_eq!(
            session.completion().await.expect("completion").reason,
            CompletionReason::AudioSourceFailed
        );
    }

    #[tokio::test]
    async fn node_attached_after_dispose_is_released_at_once() {
        let session = connected_session();
        session.dispose().await;

        let node = Arc::new(CountingResource::default());
        session.on_audio_source_attach_completed(node.clone(), false).await;
        assert_eq!(node.detaches.load(Ordering::SeqCst), 1);
        assert_eq!(session.audio_node_id(), None);
    }

    #[tokio::test]
    async fn turn_end_after_completion_emits_nothing() {
        let session = connected_session();
        session.on_service_turn_end_response(false);
        let request_id = session.request_id();
        let mut events = session.events.subscribe();

        session.on_service_turn_end_response(true);
        session.on_service_turn_end_response(false);

        assert!(events.try_recv().is_err());
        assert_eq!(session.request_id(), request_id);
        assert_eq!(session.telemetry().recognition_number, 0);
    }

    #[test]
    fn audio_counters_accumulate_per_recognition() {
        let session = connected_session();
        session.on_audio_sent(3_200);
        session.on_audio_sent(3_200);
        session.on_hypothesis(5_000);
        let t = session.telemetry();
        assert_eq!(t.bytes_sent_connection, 6_400);
        assert_eq!(t.bytes_sent_recognition, 6_400);
        assert!(t.hypothesis_received);

        session.on_service_turn_end_response(true);
        let t = session.telemetry();
        assert_eq!(t.bytes_sent_recognition, 0);
        assert_eq!(t.bytes_sent_connection, 6_400);
        assert_eq!(t.turn_start_offset, 5_000);
    }
}
