//! Wire protocol shared by every transport backend.
//!
//! Frames are JSON objects `{"event": <name>, "data": <payload>}`. The
//! payload types form a closed set; anything else is rejected at the
//! boundary before it reaches a session.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DebateError;
use crate::participant::{Participant, ParticipantId};
use crate::state::{Outcome, StateSnapshot, TranscriptEntry};

pub type SessionId = String;
pub type JobId = Uuid;

/// Longest speech text accepted from a client.
pub const MAX_SPEECH_CHARS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDebate {
    pub session_id: SessionId,
    pub topic: String,
    pub participants: Vec<Participant>,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    StartDebate(StartDebate),
    #[serde(rename_all = "camelCase")]
    JoinDebate { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    SubmitSpeech {
        participant_id: ParticipantId,
        text: String,
        /// Phase the client believes is current; a stale claim is rejected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    EndDebate,
}

impl ClientEvent {
    /// Parse and validate one inbound text frame.
    pub fn parse(frame: &str) -> Result<Self, DebateError> {
        let event: ClientEvent =
            serde_json::from_str(frame).map_err(|e| DebateError::InvalidEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), DebateError> {
        match self {
            ClientEvent::StartDebate(start) => {
                if start.session_id.trim().is_empty() {
                    return Err(DebateError::InvalidRoster("session id cannot be empty".into()));
                }
                if start.topic.trim().is_empty() {
                    return Err(DebateError::InvalidRoster("topic cannot be empty".into()));
                }
            }
            ClientEvent::JoinDebate { session_id } if session_id.trim().is_empty() => {
                return Err(DebateError::InvalidEvent("session id cannot be empty".into()));
            }
            ClientEvent::SubmitSpeech { text, .. } => {
                if text.trim().is_empty() {
                    return Err(DebateError::InvalidEvent("speech text cannot be empty".into()));
                }
                if text.chars().count() > MAX_SPEECH_CHARS {
                    return Err(DebateError::InvalidEvent(format!(
                        "speech exceeds {} characters",
                        MAX_SPEECH_CHARS
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StartDebate(_) => "startDebate",
            ClientEvent::JoinDebate { .. } => "joinDebate",
            ClientEvent::SubmitSpeech { .. } => "submitSpeech",
            ClientEvent::EndDebate => "endDebate",
        }
    }
}

/// Events sent to every subscriber of a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    DebateStateUpdate(StateSnapshot),
    TranscriptEntry(TranscriptEntry),
    #[serde(rename_all = "camelCase")]
    AiSpeech { speaker_name: String, text: String },
    #[serde(rename_all = "camelCase")]
    AiSpeechAudioChunk {
        job_id: JobId,
        seq: u32,
        #[serde(with = "base64_bytes")]
        audio: Bytes,
    },
    #[serde(rename_all = "camelCase")]
    AiSpeechAudioEnd { job_id: JobId },
    #[serde(rename_all = "camelCase")]
    AiSpeechAudio {
        job_id: JobId,
        #[serde(with = "base64_bytes")]
        audio: Bytes,
    },
    DebateEnded {
        outcome: Outcome,
        transcript: Vec<TranscriptEntry>,
    },
    DebateError { message: String, error: String },
}

impl ServerEvent {
    pub fn error(err: &DebateError) -> Self {
        ServerEvent::DebateError {
            message: err.to_string(),
            error: err.code().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::DebateStateUpdate(_) => "debateStateUpdate",
            ServerEvent::TranscriptEntry(_) => "transcriptEntry",
            ServerEvent::AiSpeech { .. } => "aiSpeech",
            ServerEvent::AiSpeechAudioChunk { .. } => "aiSpeechAudioChunk",
            ServerEvent::AiSpeechAudioEnd { .. } => "aiSpeechAudioEnd",
            ServerEvent::AiSpeechAudio { .. } => "aiSpeechAudio",
            ServerEvent::DebateEnded { .. } => "debateEnded",
            ServerEvent::DebateError { .. } => "debateError",
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_frame(&self) -> Result<String, DebateError> {
        Ok(serde_json::to_string(self)?)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
