//! Moves audio from a stream node onto the connection for the current turn.

use tracing::{debug, info};

use super::RequestSession;
use crate::audio::AudioStreamNode;
use crate::connection::Connection;
use crate::error::Result;
use crate::message::ConnectionMessage;

/// Send every chunk `node` yields as a speech `audio` message, then an empty
/// audio message marking end of stream.
///
/// Each message carries the session's request id at the time it is sent, so a
/// continuous session that rotates ids mid-stream tags later audio with the
/// new turn. Stops early, without the end marker, once the session stops
/// recognizing or completes.
///
/// Returns the number of payload bytes sent.
///
/// # Errors
/// Whatever `Connection::send` fails with.
pub async fn pump_audio(
    node: &AudioStreamNode,
    connection: &Connection,
    session: &RequestSession,
    stream_id: &str,
) -> Result<u64> {
    let mut sent = 0u64;
    while let Some(chunk) = node.read().await {
        if !session.is_recognizing() || session.is_completed() {
            debug!(node_id = node.id(), "session no longer recognizing, pump stopped");
            return Ok(sent);
        }
        let len = chunk.len();
        let message = ConnectionMessage::speech_audio(&session.request_id(), stream_id, chunk.data);
        connection.send(message).await?;
        session.on_audio_sent(len);
        sent += len as u64;
    }

    if session.is_recognizing() && !session.is_completed() {
        let end = ConnectionMessage::speech_audio(&session.request_id(), stream_id, Vec::new());
        connection.send(end).await?;
        session.on_speech_ended();
    }
    info!(node_id = node.id(), bytes = sent, "audio stream finished");
    Ok(sent)
}
