use thiserror::Error;

/// All errors produced by voxlink-core.
#[derive(Debug, Error)]
pub enum VoxlinkError {
    #[error("required argument missing: {0}")]
    ArgumentNull(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection is not open")]
    NotConnected,

    #[error("connection failed ({status_code}): {reason}")]
    ConnectionFailure { status_code: u16, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("deferred rejected: {0}")]
    Rejected(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxlinkError {
    /// `true` for errors that mean the transport is gone for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VoxlinkError::ConnectionClosed | VoxlinkError::ConnectionFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VoxlinkError>;
