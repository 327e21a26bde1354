//! Error types for the broadcast server

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors.
///
/// Everything here is fatal to the broadcast: the owner stops instead of
/// running with a half-built mixing graph.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Source already taken: {0}")]
    SourceTaken(&'static str),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Cannot open source: {0}")]
    SourceOpen(String),
}

/// Opus encoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),
}

/// Control channel errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Binary frames are not supported")]
    BinaryFrame,
}

/// Peer transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer creation failed: {0}")]
    Create(String),

    #[error("Remote description rejected: {0}")]
    RemoteDescription(String),

    #[error("Answer creation failed: {0}")]
    Answer(String),

    #[error("Candidate rejected: {0}")]
    Candidate(String),

    #[error("Transport closed")]
    Closed,
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Stale negotiation epoch {got} (current {current})")]
    StaleEpoch { got: u64, current: u64 },

    #[error("Session is terminal")]
    Terminal,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
