//! Upstream realtime wire protocol
//!
//! Control messages are JSON objects tagged by `type`. The vendor adds message types
//! over time, so unknown tags deserialize to [`ServerEvent::Unknown`] instead of
//! failing. Binary frames are raw PCM16 and never pass through this module.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Prepended to outgoing text so the model recites it instead of paraphrasing
pub const VERBATIM_PREAMBLE: &str = "Read the following text aloud exactly as written, word for word, \
without adding, removing, or rephrasing anything:";

/// Message sent to the upstream endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Identity/voice configuration, sent once per connection
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Add a content item to the conversation
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Ask the model to generate a response
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseConfig },

    /// Abort the response currently being generated
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

/// Session configuration payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub voice: String,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
}

/// Input transcription settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// A conversation item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// One part of a conversation item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

/// Response generation settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseConfig {
    pub modalities: Vec<String>,
}

fn audio_and_text() -> Vec<String> {
    vec!["audio".to_string(), "text".to_string()]
}

impl ClientEvent {
    /// Voice configuration for a new connection
    #[must_use]
    pub fn session_update(voice: &str, instructions: Option<String>) -> Self {
        Self::SessionUpdate {
            session: SessionConfig {
                voice: voice.to_string(),
                modalities: audio_and_text(),
                input_audio_format: "pcm16".to_string(),
                output_audio_format: "pcm16".to_string(),
                instructions,
                input_audio_transcription: Some(TranscriptionConfig {
                    model: "whisper-1".to_string(),
                }),
            },
        }
    }

    /// User message carrying `text` behind the verbatim preamble
    #[must_use]
    pub fn verbatim_item(text: &str) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem {
                kind: "message".to_string(),
                role: "user".to_string(),
                content: vec![ContentPart::InputText {
                    text: format!("{VERBATIM_PREAMBLE}\n\n{text}"),
                }],
            },
        }
    }

    /// Request an audio + text response
    #[must_use]
    pub fn generate_response() -> Self {
        Self::ResponseCreate {
            response: ResponseConfig {
                modalities: audio_and_text(),
            },
        }
    }

    /// Logical control kind for logging and ordering checks
    #[must_use]
    pub const fn control_kind(&self) -> ControlKind {
        match self {
            Self::SessionUpdate { .. } => ControlKind::SessionOpen,
            Self::ConversationItemCreate { .. } => ControlKind::ContentItemCreate,
            Self::ResponseCreate { .. } => ControlKind::GenerateResponse,
            Self::ResponseCancel => ControlKind::CancelResponse,
        }
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message received from the upstream endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionRef,
    },

    /// Configuration acknowledged
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionRef,
    },

    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        #[serde(default)]
        item: ItemRef,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseRef,
    },

    /// Base64 PCM16 audio delivered inside a control message
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: String,
    },

    /// Transcription of the user's own speech
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscript {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseRef,
    },

    #[serde(rename = "error")]
    Error { error: ErrorBody },

    /// Any type this crate does not understand
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ItemRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ResponseRef {
    /// Whether the vendor reports this response as cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ServerEvent {
    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a JSON object with a known shape for its tag
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Logical control kind, `None` for informational and unknown messages
    #[must_use]
    pub const fn control_kind(&self) -> Option<ControlKind> {
        match self {
            Self::SessionUpdated { .. } => Some(ControlKind::SessionReady),
            Self::ItemCreated { .. } => Some(ControlKind::ContentItemCreated),
            Self::ResponseDone { .. } => Some(ControlKind::ResponseComplete),
            Self::TranscriptDelta { .. } => Some(ControlKind::TranscriptDelta),
            Self::TranscriptDone { .. } | Self::InputTranscript { .. } => {
                Some(ControlKind::TranscriptFinal)
            }
            Self::Error { .. } => Some(ControlKind::Error),
            Self::SessionCreated { .. }
            | Self::ResponseCreated { .. }
            | Self::AudioDelta { .. }
            | Self::Unknown => None,
        }
    }
}

/// Control message kinds, independent of the vendor's tag strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    SessionOpen,
    SessionReady,
    ContentItemCreate,
    ContentItemCreated,
    GenerateResponse,
    CancelResponse,
    ResponseComplete,
    TranscriptDelta,
    TranscriptFinal,
    Error,
}
