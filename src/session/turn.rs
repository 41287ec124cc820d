//! Turn state machine: streamed frames in, a coherent transcript out.
//!
//! Messages live in an owned arena (`Vec<ConversationMessage>`); the
//! machine refers to the message currently being streamed into by index
//! only, never by a second owning handle. A turn opens implicitly with the
//! first content frame after the prior turn completed and closes on
//! `turn_complete`, freezing the message.

use crate::session::frame::{MimeType, Role, WireFrame};

/// Index of a message in the transcript arena.
pub type MessageId = usize;

/// One message in the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub role: Role,
    /// Mutable while streaming; frozen once `complete` is set.
    pub text: String,
    /// True when any audio arrived during this message's turn.
    pub has_audio: bool,
    /// Frozen by `turn_complete`; no further appends.
    pub complete: bool,
}

/// Whether a turn is open, and for whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    Streaming(Role),
}

/// Transcript changes produced by applying one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A new message opened.
    MessageStarted { id: MessageId, role: Role },
    /// Text was appended to an open message.
    MessageAppended { id: MessageId },
    /// Audio became part of an open message.
    AudioAttached { id: MessageId },
    /// The turn closed; `id` is the frozen message, if one was open.
    TurnCompleted { id: Option<MessageId> },
}

/// Accumulates streamed chunks into turn-structured messages.
#[derive(Debug, Default)]
pub struct TurnStateMachine {
    messages: Vec<ConversationMessage>,
    phase: TurnPhase,
    current: Option<MessageId>,
}

impl TurnStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current turn phase.
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// All messages, oldest first.
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Look up one message.
    pub fn message(&self, id: MessageId) -> Option<&ConversationMessage> {
        self.messages.get(id)
    }

    /// Id of the message currently being streamed into.
    pub fn current(&self) -> Option<MessageId> {
        self.current
    }

    /// Apply one decoded inbound frame and report what changed.
    ///
    /// Text and audio addressed to the same open turn attach to the same
    /// message — a turn is one message, possibly with both streamed text
    /// and an audio flag.
    pub fn apply(&mut self, frame: &WireFrame) -> Vec<TurnEvent> {
        let mut events = Vec::new();

        if let (Some(mime), Some(data)) = (frame.mime_type, frame.data.as_deref()) {
            match mime {
                MimeType::Text => events.extend(self.apply_text(frame.role_or_default(), data)),
                MimeType::AudioPcm => events.extend(self.apply_audio()),
            }
        }

        if frame.turn_complete {
            events.push(self.complete_turn());
        }

        events
    }

    /// Record a locally composed user message. The user sends complete
    /// messages, so the entry is created already frozen and the open turn
    /// (if any) is left untouched.
    pub fn push_user_message(&mut self, text: impl Into<String>) -> MessageId {
        let id = self.messages.len();
        self.messages.push(ConversationMessage {
            role: Role::User,
            text: text.into(),
            has_audio: false,
            complete: true,
        });
        id
    }

    fn apply_text(&mut self, role: Role, chunk: &str) -> Vec<TurnEvent> {
        if let (TurnPhase::Streaming(streaming_role), Some(id)) = (self.phase, self.current)
            && streaming_role == role
            && !self.messages[id].complete
        {
            self.messages[id].text.push_str(chunk);
            return vec![TurnEvent::MessageAppended { id }];
        }

        let id = self.start_message(role, chunk.to_string());
        vec![
            TurnEvent::MessageStarted { id, role },
            TurnEvent::MessageAppended { id },
        ]
    }

    fn apply_audio(&mut self) -> Vec<TurnEvent> {
        // Audio belongs to the newest agent message; open a placeholder
        // when no agent turn is streaming.
        let id = match (self.phase, self.current) {
            (TurnPhase::Streaming(Role::Model), Some(id)) if !self.messages[id].complete => id,
            _ => {
                let id = self.start_message(Role::Model, String::new());
                return if self.mark_audio(id) {
                    vec![
                        TurnEvent::MessageStarted {
                            id,
                            role: Role::Model,
                        },
                        TurnEvent::AudioAttached { id },
                    ]
                } else {
                    vec![TurnEvent::MessageStarted {
                        id,
                        role: Role::Model,
                    }]
                };
            }
        };

        if self.mark_audio(id) {
            vec![TurnEvent::AudioAttached { id }]
        } else {
            Vec::new()
        }
    }

    fn start_message(&mut self, role: Role, text: String) -> MessageId {
        let id = self.messages.len();
        self.messages.push(ConversationMessage {
            role,
            text,
            has_audio: false,
            complete: false,
        });
        self.phase = TurnPhase::Streaming(role);
        self.current = Some(id);
        id
    }

    /// Returns true on the false→true transition.
    fn mark_audio(&mut self, id: MessageId) -> bool {
        let message = &mut self.messages[id];
        if message.has_audio {
            false
        } else {
            message.has_audio = true;
            true
        }
    }

    fn complete_turn(&mut self) -> TurnEvent {
        let id = self.current.take();
        if let Some(id) = id {
            self.messages[id].complete = true;
        }
        self.phase = TurnPhase::Idle;
        TurnEvent::TurnCompleted { id }
    }
}
