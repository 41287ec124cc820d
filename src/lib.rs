//! tutorlink - Real-time voice/text tutoring transport
//!
//! Turns a duplex websocket into a reliable, turn-structured conversation
//! of streamed text and audio, while driving a live microphone capture
//! pipeline and a live speaker playback pipeline.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod session;

// Audio pipelines (capture → wire, wire → playback)
pub use audio::capture::{
    AudioCapture, CaptureBlock, CaptureConfig, CaptureHandle, CaptureSource, MockCaptureSource,
};
pub use audio::playback::{AudioRenderer, RendererConfig};
pub use audio::ring::CircularAudioBuffer;

// Session layer
pub use session::connector::{Connector, WsConnector};
pub use session::context::{Mode, SessionContext};
pub use session::controller::{CaptureSourceFactory, SessionController, SessionEvent};
pub use session::frame::{MimeType, Role, WireFrame};
pub use session::transport::{SessionTransport, TransportEvent, TransportState};
pub use session::turn::{ConversationMessage, MessageId, TurnEvent, TurnStateMachine};

// Error handling
pub use error::{Result, TutorlinkError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
