//! Session context: who is studying what, in which mode, with or without
//! audio.
//!
//! The full context travels as query parameters of the connection target;
//! the remote agent reads them once at connect time. Changing any field
//! therefore means tearing the connection down and opening a new one.

use crate::error::{Result, TutorlinkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Tutoring mode selected by the student. The remote agent keys its
/// behavior off this at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Quiz,
    Interview,
    Flashcard,
}

impl Mode {
    /// Wire form of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quiz => "quiz",
            Mode::Interview => "interview",
            Mode::Flashcard => "flashcard",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = TutorlinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quiz" => Ok(Mode::Quiz),
            "interview" => Ok(Mode::Interview),
            "flashcard" => Ok(Mode::Flashcard),
            other => Err(TutorlinkError::ConfigInvalidValue {
                key: "mode".to_string(),
                message: format!("unknown mode '{}'", other),
            }),
        }
    }
}

/// Immutable-until-changed session parameters. Any field change
/// invalidates the live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub user_id: String,
    pub subject: String,
    pub chapter: String,
    pub topic: String,
    pub mode: Mode,
    pub audio_enabled: bool,
}

impl SessionContext {
    /// Build the connection target for this context.
    ///
    /// `session_id` is generated fresh per connect; it is never reused
    /// across reconnections.
    ///
    /// # Errors
    /// `TransportConnect` when the endpoint is not a valid URL.
    pub fn endpoint_url(&self, endpoint: &str, session_id: &str) -> Result<Url> {
        let mut url = Url::parse(endpoint).map_err(|e| TutorlinkError::TransportConnect {
            message: format!("invalid endpoint '{}': {}", endpoint, e),
        })?;

        url.query_pairs_mut()
            .append_pair("session_id", session_id)
            .append_pair("user_id", &self.user_id)
            .append_pair("subject", &self.subject)
            .append_pair("chapter", &self.chapter)
            .append_pair("topic", &self.topic)
            .append_pair("mode", self.mode.as_str())
            .append_pair("is_audio", if self.audio_enabled { "true" } else { "false" });

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SessionContext {
        SessionContext {
            user_id: "student-7".to_string(),
            subject: "physics".to_string(),
            chapter: "waves".to_string(),
            topic: "standing waves".to_string(),
            mode: Mode::Quiz,
            audio_enabled: true,
        }
    }

    #[test]
    fn test_mode_roundtrip() {
        for mode in [Mode::Quiz, Mode::Interview, Mode::Flashcard] {
            assert_eq!(Mode::from_str(mode.as_str()).unwrap(), mode);
        }
    }

    #[test]
    fn test_mode_from_str_rejects_unknown() {
        assert!(Mode::from_str("lecture").is_err());
    }

    #[test]
    fn test_endpoint_url_carries_full_context() {
        let url = context()
            .endpoint_url("ws://localhost:8000/ws", "abc-123")
            .unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("session_id=abc-123"));
        assert!(query.contains("user_id=student-7"));
        assert!(query.contains("subject=physics"));
        assert!(query.contains("chapter=waves"));
        assert!(query.contains("mode=quiz"));
        assert!(query.contains("is_audio=true"));
    }

    #[test]
    fn test_endpoint_url_escapes_values() {
        let url = context()
            .endpoint_url("ws://localhost:8000/ws", "id")
            .unwrap();
        // "standing waves" must not appear with a raw space.
        assert!(!url.as_str().contains("standing waves"));
        let topic = url
            .query_pairs()
            .find(|(k, _)| k == "topic")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(topic, "standing waves");
    }

    #[test]
    fn test_endpoint_url_audio_flag_off() {
        let mut ctx = context();
        ctx.audio_enabled = false;
        let url = ctx.endpoint_url("ws://localhost:8000/ws", "id").unwrap();
        assert!(url.query().unwrap().contains("is_audio=false"));
    }

    #[test]
    fn test_invalid_endpoint_is_connect_error() {
        let result = context().endpoint_url("not a url", "id");
        assert!(matches!(
            result,
            Err(TutorlinkError::TransportConnect { .. })
        ));
    }
}
