//! Debate state: current phase, speaker, clock and transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debate_format::PhaseDefinition;
use crate::participant::ParticipantId;

/// Position of a session in its phase table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebatePhase {
    NotStarted,
    /// Index into the format's phase table.
    Running(usize),
    Completed,
    Aborted,
}

impl DebatePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, DebatePhase::Completed | DebatePhase::Aborted)
    }

    /// Wire name of the phase.
    pub fn key(self, phases: &[PhaseDefinition]) -> &str {
        match self {
            DebatePhase::NotStarted => "not_started",
            DebatePhase::Running(i) => phases.get(i).map(|p| p.key.as_str()).unwrap_or("unknown"),
            DebatePhase::Completed => "completed",
            DebatePhase::Aborted => "aborted",
        }
    }
}

/// One accepted speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub participant_id: ParticipantId,
    pub speaker_name: String,
    /// Key of the phase the speech was accepted in.
    pub phase: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Set when the text is the deterministic stand-in for a failed generation.
    #[serde(default)]
    pub fallback: bool,
}

/// Periodic and phase-change snapshot sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub phase: String,
    pub current_speaker_id: Option<ParticipantId>,
    pub remaining_time: u32,
}

/// How a session finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Aborted { reason: String },
}

/// Mutable state of one session. Only the owning orchestrator writes to it.
#[derive(Debug, Clone)]
pub struct DebateState {
    pub phase: DebatePhase,
    pub current_speaker_id: Option<ParticipantId>,
    pub remaining_time: u32,
    transcript: Vec<TranscriptEntry>,
}

impl DebateState {
    pub fn new() -> Self {
        Self {
            phase: DebatePhase::NotStarted,
            current_speaker_id: None,
            remaining_time: 0,
            transcript: Vec::new(),
        }
    }

    /// Append-only access; entries are never edited or reordered.
    pub fn append(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry);
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn snapshot(&self, phases: &[PhaseDefinition]) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase.key(phases).to_string(),
            current_speaker_id: self.current_speaker_id.clone(),
            remaining_time: self.remaining_time,
        }
    }
}

impl Default for DebateState {
    fn default() -> Self {
        Self::new()
    }
}
