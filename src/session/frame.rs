//! JSON wire frames multiplexing text and audio over the session socket.
//!
//! Every frame is a small JSON object tagged with a mime type. A frame may
//! instead carry only `turn_complete: true`, which closes the current turn
//! without any payload.

use crate::audio::codec;
use crate::error::{Result, TutorlinkError};
use serde::{Deserialize, Serialize};

/// Content type of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    /// Streamed text chunk.
    #[serde(rename = "text/plain")]
    Text,
    /// Base64-encoded raw PCM16 audio.
    #[serde(rename = "audio/pcm")]
    AudioPcm,
}

/// Who produced a message or frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    /// Local-only role for transcript notices; never sent on the wire.
    System,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<MimeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub turn_complete: bool,
}

impl WireFrame {
    /// Build a text frame for the given role.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            mime_type: Some(MimeType::Text),
            data: Some(text.into()),
            role: Some(role),
            turn_complete: false,
        }
    }

    /// Build an audio frame from raw PCM16 bytes. Audio always travels
    /// with the user role on the outbound path.
    pub fn audio(pcm_bytes: &[u8]) -> Self {
        Self {
            mime_type: Some(MimeType::AudioPcm),
            data: Some(codec::encode_transport(pcm_bytes)),
            role: Some(Role::User),
            turn_complete: false,
        }
    }

    /// Build a standalone turn-completion frame.
    pub fn completion() -> Self {
        Self {
            mime_type: None,
            data: None,
            role: None,
            turn_complete: true,
        }
    }

    /// Role of the frame, defaulting to the remote agent when absent.
    pub fn role_or_default(&self) -> Role {
        self.role.unwrap_or(Role::Model)
    }

    /// Decode the payload of an audio frame back into PCM16 bytes.
    ///
    /// # Errors
    /// `Decode` when the frame is not audio or the base64 is malformed.
    pub fn audio_bytes(&self) -> Result<Vec<u8>> {
        match (self.mime_type, &self.data) {
            (Some(MimeType::AudioPcm), Some(data)) => codec::decode_transport(data),
            _ => Err(TutorlinkError::Decode {
                message: "frame carries no audio payload".to_string(),
            }),
        }
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(TutorlinkError::decode)
    }

    /// Parse a frame from the wire form.
    ///
    /// # Errors
    /// `Decode` for malformed JSON or unknown field values; the caller
    /// drops the single frame and continues.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(TutorlinkError::decode)
    }
}
