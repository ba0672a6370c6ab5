//! Request/reply correlation for conversation commands.
//!
//! Commands go out as JSON text messages carrying a fresh `requestId`. The
//! reply routed back through `dispatch` (matched on the `X-RequestId` header
//! or the JSON `requestId` field) completes the `Deferred` returned by `send`.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::deferral::{DeferralMap, Deferred};
use crate::error::{Result, VoxlinkError};
use crate::message::{header_names, new_id, ConnectionMessage, Headers};

const REQUEST_ID_FIELD: &str = "requestId";
const TYPE_FIELD: &str = "type";

pub struct ConversationCommands {
    connection: Arc<Connection>,
    pending: DeferralMap<ConnectionMessage>,
}

impl ConversationCommands {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            pending: DeferralMap::new(),
        }
    }

    /// Send a command and return the handle its reply will complete.
    ///
    /// `payload` must be a JSON object (or null); `type` and `requestId` are
    /// filled in.
    ///
    /// # Errors
    /// - `VoxlinkError::ProtocolViolation` for a non-object payload.
    /// - Whatever `Connection::send` fails with; nothing stays pending then.
    pub async fn send(&self, command_type: &str, payload: Value) -> Result<Deferred<ConnectionMessage>> {
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(VoxlinkError::ProtocolViolation(format!(
                    "command payload must be an object, got {other}"
                )))
            }
        };
        let request_id = new_id();
        body.insert(TYPE_FIELD.into(), Value::String(command_type.to_string()));
        body.insert(REQUEST_ID_FIELD.into(), Value::String(request_id.clone()));

        let headers = Headers::new().with(header_names::REQUEST_ID, request_id.as_str());
        let message = ConnectionMessage::text(Value::Object(body).to_string(), headers);

        let handle = Deferred::new();
        self.pending.add(request_id.as_str(), handle.clone());
        if let Err(e) = self.connection.send(message).await {
            self.pending.reject(&request_id, e.to_string());
            return Err(e);
        }
        debug!(command_type, request_id = request_id.as_str(), "conversation command sent");
        Ok(handle)
    }

    /// Route an inbound message. Returns it back when it answers no pending
    /// command.
    pub fn dispatch(&self, message: ConnectionMessage) -> Option<ConnectionMessage> {
        let Some(request_id) = reply_request_id(&message) else {
            return Some(message);
        };
        if self.pending.get(&request_id).is_none() {
            return Some(message);
        }
        self.pending.complete(&request_id, message);
        None
    }

    /// Read from the connection until it closes, completing replies and
    /// handing everything else to `on_unmatched`. Pending commands are
    /// rejected when the loop ends.
    pub async fn run(&self, mut on_unmatched: impl FnMut(ConnectionMessage)) -> Result<()> {
        loop {
            match self.connection.read().await {
                Ok(message) => {
                    if let Some(other) = self.dispatch(message) {
                        on_unmatched(other);
                    }
                }
                Err(VoxlinkError::ConnectionClosed) => {
                    self.close("connection closed");
                    return Ok(());
                }
                Err(e) => {
                    self.close(&e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// Reject every pending command.
    pub fn close(&self, reason: &str) {
        if !self.pending.is_empty() {
            info!(pending = self.pending.len(), reason, "rejecting pending conversation commands");
        }
        self.pending.reject_all(reason);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn reply_request_id(message: &ConnectionMessage) -> Option<String> {
    if let Some(id) = message.request_id() {
        return Some(id.to_string());
    }
    let body: Value = serde_json::from_str(message.text_body()?).ok()?;
    body.get(REQUEST_ID_FIELD)?.as_str().map(str::to_string)
}
