//! Debate participant definitions.
//!
//! Represents human and AI debaters with their team and speaking slot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a participant within a session.
pub type ParticipantId = String;

/// Side of the debate a participant argues for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Team {
    /// Arguing in favor of the topic.
    Pro,
    /// Arguing against the topic.
    Con,
}

impl Team {
    pub fn display_name(&self) -> &str {
        match self {
            Team::Pro => "PRO",
            Team::Con => "CON",
        }
    }

    pub fn opponent(&self) -> Team {
        match self {
            Team::Pro => Team::Con,
            Team::Con => Team::Pro,
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Ordered speaking slot within a team.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerSlot {
    First,
    Second,
}

impl fmt::Display for SpeakerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeakerSlot::First => f.write_str("first speaker"),
            SpeakerSlot::Second => f.write_str("second speaker"),
        }
    }
}

/// A participant in the debate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    /// Display name for this participant.
    pub name: String,
    #[serde(default)]
    pub is_ai: bool,
    pub team: Team,
    pub slot: SpeakerSlot,
    /// LLM model override for AI participants (e.g., "gpt-4o", "llama3:8b").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Optional custom system prompt override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_system_prompt: Option<String>,
    /// Voice ID for speech synthesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

impl Participant {
    /// Create a human participant.
    pub fn human(
        id: impl Into<String>,
        name: impl Into<String>,
        team: Team,
        slot: SpeakerSlot,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_ai: false,
            team,
            slot,
            model: None,
            custom_system_prompt: None,
            voice_id: None,
        }
    }

    /// Create an AI participant.
    pub fn ai(id: impl Into<String>, name: impl Into<String>, team: Team, slot: SpeakerSlot) -> Self {
        Self {
            is_ai: true,
            ..Self::human(id, name, team, slot)
        }
    }

    /// Set the model used for generation.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set a custom system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_system_prompt = Some(prompt.into());
        self
    }

    /// Set the voice ID for TTS.
    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    /// Get the full display name with team.
    pub fn display_name_with_team(&self) -> String {
        format!("{} ({})", self.name, self.team.display_name())
    }
}
