//! Error types for tutorlink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TutorlinkError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Audio capture errors
    #[error("Audio capture device not found: {device}")]
    CaptureDeviceNotFound { device: String },

    #[error("Audio capture unavailable: {message}")]
    CaptureUnavailable { message: String },

    // Audio playback errors
    #[error("Audio playback unavailable: {message}")]
    PlaybackUnavailable { message: String },

    // Transport errors
    #[error("Transport connection failed: {message}")]
    TransportConnect { message: String },

    #[error("Transport closed unexpectedly: {message}")]
    TransportClosed { message: String },

    #[error("A connection is already open or connecting; close it first")]
    ConnectionBusy,

    #[error("Cannot send: transport is not open")]
    SendOnClosedTransport,

    // Wire format errors
    #[error("Failed to decode frame: {message}")]
    Decode { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TutorlinkError {
    /// Shorthand for a `Decode` error from any displayable cause.
    pub fn decode(err: impl std::fmt::Display) -> Self {
        TutorlinkError::Decode {
            message: err.to_string(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, TutorlinkError>;
