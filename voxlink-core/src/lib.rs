//! # voxlink-core
//!
//! Client-side protocol engine for a cloud speech service reached over a
//! persistent WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! AudioSource ─► AudioSourceMultiplexer ─► AudioStreamNode ─► pump_audio ─┐
//!                                                                         ▼
//! AuthenticationProvider ─► ConnectionFactory ─► Connection ◄─► MessageFormatter ◄─► Transport
//!                                                    │
//!                                                    ▼
//!                                RequestSession / ConversationCommands (DeferralMap)
//! ```
//!
//! Lifecycle events from connections and sessions flow through an explicitly
//! passed `EventSink`. The library never installs a tracing subscriber.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod auth;
pub mod buffering;
pub mod config;
pub mod connection;
pub mod deferral;
pub mod error;
pub mod events;
pub mod message;
pub mod session;

pub use audio::{
    AudioFormat, AudioSource, AudioSourceMultiplexer, AudioStreamNode, MicrophoneSource,
    PushAudioSource, WavFileSource,
};
pub use auth::{AuthInfo, AuthenticationProvider, SubscriptionKeyAuth, TokenAuth};
pub use buffering::AudioChunk;
pub use config::{load_config, save_config, OutputFormat, RecognitionMode, ServiceConfig};
pub use connection::{
    Connection, ConnectionFactory, ConnectionOpenResponse, ConnectionState, Transport, WsTransport,
};
pub use deferral::{DeferralMap, Deferred};
pub use error::{Result, VoxlinkError};
pub use events::{EventEnvelope, EventSink, PlatformEvent};
pub use message::{
    ConnectionMessage, ConversationMessageFormatter, Headers, MessageFormatter, MessageKind,
    RawWireMessage, SpeechMessageFormatter,
};
pub use session::{
    CompletionReason, ConversationCommands, Detachable, RequestSession, TurnCompletion, TurnState,
};
