use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use voxlink_core::audio::{AudioFormat, AudioSourceMultiplexer, PushAudioSource};
use voxlink_core::auth::{token_callback, AuthenticationProvider, SubscriptionKeyAuth, TokenAuth};
use voxlink_core::connection::loopback::{LoopbackPeer, LoopbackServer, LoopbackTransport};
use voxlink_core::connection::{ConnectionFactory, ConnectionState};
use voxlink_core::message::{new_id, MessageFormatter, SpeechMessageFormatter};
use voxlink_core::session::pump_audio;
use voxlink_core::{
    CompletionReason, Connection, ConnectionMessage, EventSink, PlatformEvent, RequestSession,
    ServiceConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("voxlink_core=debug"))
        .with_test_writer()
        .try_init();
}

fn factory(events: &EventSink) -> (ConnectionFactory, LoopbackTransport, LoopbackServer) {
    let (transport, server) = LoopbackTransport::new();
    let factory = ConnectionFactory::with_transport(
        ServiceConfig::default(),
        Arc::new(transport.clone()),
        events.clone(),
    )
    .expect("factory");
    (factory, transport, server)
}

/// Run the connect half of a turn the way a recognizer drives it.
async fn connect(
    factory: &ConnectionFactory,
    auth: &dyn AuthenticationProvider,
    session: &RequestSession,
) -> Arc<Connection> {
    let connection_id = new_id();
    let auth_event = session.auth_fetch_event_id();
    session.on_pre_connection_start(&auth_event, &connection_id);

    let info = auth.fetch(&auth_event).await;
    session.on_auth_completed(info.is_err());
    let connection = factory
        .create(&info.expect("auth"), &connection_id)
        .expect("create");
    let response = connection.open().await.expect("open");
    session.on_connection_establish_completed(response.status_code);
    Arc::new(connection)
}

fn service_message(peer: &LoopbackPeer, path: &str, request_id: &str, body: &str) {
    let message = ConnectionMessage::speech_text(path, request_id, "application/json", body);
    let frame = SpeechMessageFormatter
        .from_connection_message(&message)
        .expect("encode");
    assert!(peer.send(frame));
}

/// Feed inbound service messages into the session until a turn ends.
async fn drive_turn(connection: &Connection, session: &RequestSession, continuous: bool) {
    loop {
        let message = connection.read().await.expect("read");
        match message.path() {
            Some("turn.start") => session.on_service_turn_start_response(),
            Some("speech.hypothesis") => session.on_hypothesis(1_000),
            Some("speech.phrase") => session.on_phrase_recognized(2_000),
            Some("turn.end") => {
                session.on_service_turn_end_response(continuous);
                return;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn single_shot_recognition_end_to_end() {
    init_tracing();
    let events = EventSink::default();
    let (factory, transport, mut server) = factory(&events);
    let auth = SubscriptionKeyAuth::new("test-key").expect("auth");
    let session = RequestSession::new(events.clone());

    let connection = connect(&factory, &auth, &session).await;
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(session.session_id(), connection.id());
    let mut peer = server.accept().await.expect("peer");

    let source = Arc::new(PushAudioSource::new(AudioFormat::default(), 100).expect("source"));
    let writer = source.writer();
    let mux = AudioSourceMultiplexer::new(source.clone());
    let node = Arc::new(mux.attach("recognizer").expect("attach"));
    session.on_audio_source_attach_completed(node.clone(), false).await;

    writer.write(&[0u8; 6_400]).expect("write");
    writer.close();

    let sent = pump_audio(&node, &connection, &session, "1")
        .await
        .expect("pump");
    assert_eq!(sent, 6_400);
    assert!(session.is_speech_ended());
    assert_eq!(session.telemetry().bytes_sent_recognition, 6_400);

    let request_id = session.request_id();
    let mut payload_sizes = Vec::new();
    for _ in 0..3 {
        let frame = peer.recv().await.expect("audio frame");
        let message = SpeechMessageFormatter
            .to_connection_message(frame)
            .expect("decode");
        assert_eq!(message.path(), Some("audio"));
        assert_eq!(message.request_id(), Some(request_id.as_str()));
        payload_sizes.push(message.binary_body().map_or(0, |b| b.len()));
    }
    assert_eq!(payload_sizes, vec![3_200, 3_200, 0]);

    service_message(&peer, "turn.start", &request_id, "{}");
    service_message(&peer, "speech.hypothesis", &request_id, r#"{"Text":"hel"}"#);
    service_message(&peer, "speech.phrase", &request_id, r#"{"DisplayText":"Hello."}"#);
    service_message(&peer, "turn.end", &request_id, "{}");
    drive_turn(&connection, &session, false).await;

    let completion = session.completion().await.expect("completion");
    assert_eq!(completion.reason, CompletionReason::TurnEnded);
    assert_eq!(completion.request_id, request_id);
    assert_eq!(completion.session_id, connection.id());

    session.dispose().await;
    connection.dispose(None).await;
    assert!(node.is_detached());
    assert!(!mux.is_source_on());
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    let handshake = &transport.requests()[0];
    assert_eq!(handshake.headers.get("Ocp-Apim-Subscription-Key"), Some("test-key"));
}

#[tokio::test]
async fn continuous_recognition_emits_distinct_turn_ids() {
    init_tracing();
    let events = EventSink::default();
    let mut rx = events.subscribe();
    let (factory, _transport, mut server) = factory(&events);
    let auth = SubscriptionKeyAuth::new("test-key").expect("auth");
    let session = RequestSession::new(events.clone());

    let connection = connect(&factory, &auth, &session).await;
    let peer = server.accept().await.expect("peer");

    for _ in 0..3 {
        let request_id = session.request_id();
        service_message(&peer, "turn.start", &request_id, "{}");
        service_message(&peer, "turn.end", &request_id, "{}");
        drive_turn(&connection, &session, true).await;
    }
    assert!(!session.is_completed());

    let mut ended = Vec::new();
    let mut last_seq = None;
    while let Ok(envelope) = rx.try_recv() {
        if let Some(prev) = last_seq {
            assert!(envelope.seq > prev);
        }
        last_seq = Some(envelope.seq);
        if let PlatformEvent::TurnEnded { request_id, .. } = envelope.event {
            ended.push(request_id);
        }
    }
    assert_eq!(ended.len(), 3);
    ended.sort();
    ended.dedup();
    assert_eq!(ended.len(), 3);

    session.dispose().await;
    assert_eq!(
        session.completion().await.expect("completion").reason,
        CompletionReason::Disposed
    );
    connection.dispose(Some("recognition stopped")).await;
}

#[tokio::test]
async fn forbidden_handshake_completes_the_session() {
    init_tracing();
    let events = EventSink::default();
    let (factory, transport, _server) = factory(&events);
    transport.reject_next(403, "Forbidden");

    let auth = TokenAuth::new(
        Some(token_callback(|_| async { Ok("abc123".to_string()) })),
        Some(token_callback(|_| async { Ok("renewed".to_string()) })),
    )
    .expect("token auth");
    let session = RequestSession::new(events.clone());

    let connection = connect(&factory, &auth, &session).await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    let completion = session.completion().await.expect("completion");
    assert_eq!(
        completion.reason,
        CompletionReason::AuthRejected { status_code: 403 }
    );

    let handshake = &transport.requests()[0];
    assert_eq!(handshake.headers.get("Authorization"), Some("Bearer abc123"));
}

#[tokio::test]
async fn audio_node_attached_after_dispose_turns_the_source_off() {
    init_tracing();
    let session = RequestSession::new(EventSink::default());
    session.dispose().await;

    let source = Arc::new(PushAudioSource::new(AudioFormat::default(), 100).expect("source"));
    let mux = AudioSourceMultiplexer::new(source);
    let node = Arc::new(mux.attach("recognizer").expect("attach"));
    assert!(mux.is_source_on());

    session.on_audio_source_attach_completed(node.clone(), false).await;
    assert!(node.is_detached());
    assert!(!mux.is_source_on());
}
