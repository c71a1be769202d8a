//! Crate-wide error types. Modules expose their own `thiserror` enums at
//! their boundary; `StreamerError` unifies them for `main`'s exit-code match.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config key '{0}' is not recognized")]
    UnknownKey(String),
    #[error("config key '{key}' rejected value '{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("config key '{0}' cannot be changed remotely")]
    NotRemoteEditable(String),
    #[error("config file unreadable: {0}")]
    Unreadable(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder already initialized")]
    AlreadyInitialized,
    #[error("encoder not initialized")]
    NotInitialized,
    #[error("camera device not detected")]
    DeviceMissing,
    #[error("camera or encoder device busy")]
    DeviceBusy,
    #[error("insufficient GPU memory for requested resolution")]
    InsufficientGpuMemory,
    #[error("encoder reinit failed: {0}")]
    ReinitFailed(String),
    #[error("gstreamer error: {0}")]
    Gstreamer(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("streamer session is already in use by another user")]
    SessionOccupied,
    #[error("no active session for peer {0}")]
    NoSuchPeer(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("message is not valid JSON or a recognized command")]
    MessageInvalid,
    #[error("chunk buffer exceeded the retry limit and was dropped")]
    ChunkOverflow,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("still capture timed out waiting for a frame")]
    Timeout,
    #[error("camera busy with the live encoder")]
    DeviceBusy,
    #[error("gstreamer error: {0}")]
    Gstreamer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error surfaced to `main`. Each variant maps to the exit-code
/// policy in spec.md §6/§7.
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to bind signaling port: {0}")]
    PortBind(std::io::Error),
}

impl StreamerError {
    /// Process exit code per spec.md §6 "Exit codes".
    pub fn exit_code(&self) -> i32 {
        match self {
            StreamerError::Encoder(EncoderError::DeviceMissing) => 2,
            StreamerError::Encoder(EncoderError::InsufficientGpuMemory) => 3,
            StreamerError::Config(_) => 4,
            StreamerError::PortBind(_) => 5,
            _ => 1,
        }
    }
}
