//! Error types for the debate system.

use thiserror::Error;

use crate::participant::ParticipantId;

#[derive(Error, Debug)]
pub enum DebateError {
    #[error("Invalid roster: {0}")]
    InvalidRoster(String),

    #[error("Not your turn: participant '{participant_id}' may not speak now")]
    NotYourTurn { participant_id: ParticipantId },

    #[error("Wrong phase: {0}")]
    WrongPhase(String),

    #[error("Generation failed for {speaker}: {reason}")]
    Generation { speaker: String, reason: String },

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport disconnected after {attempts} reconnect attempts")]
    TransportDisconnect { attempts: u32 },

    #[error("Session registry is at capacity ({capacity} sessions)")]
    RegistryFull { capacity: usize },

    #[error("Session '{0}' already exists")]
    SessionExists(String),

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session '{0}' is closed")]
    SessionClosed(String),

    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown debate format: {0}")]
    UnknownFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DebateError {
    /// Short machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            DebateError::InvalidRoster(_) => "InvalidRosterError",
            DebateError::NotYourTurn { .. } => "NotYourTurnError",
            DebateError::WrongPhase(_) => "WrongPhaseError",
            DebateError::Generation { .. } | DebateError::OpenAIError(_) => "GenerationFailure",
            DebateError::Synthesis(_) => "SynthesisFailure",
            DebateError::InvalidEvent(_) => "InvalidEventError",
            DebateError::Transport(_) | DebateError::TransportDisconnect { .. } => {
                "TransportDisconnect"
            }
            DebateError::RegistryFull { .. } => "RegistryFullError",
            DebateError::SessionExists(_) => "SessionExistsError",
            DebateError::SessionNotFound(_) | DebateError::SessionClosed(_) => "SessionNotFoundError",
            DebateError::ConfigError(_) | DebateError::UnknownFormat(_) => "ConfigError",
            DebateError::Io(_) | DebateError::Serialization(_) => "InternalError",
        }
    }

    /// Whether the error came from bad client input rather than a failing collaborator.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DebateError::InvalidRoster(_)
                | DebateError::NotYourTurn { .. }
                | DebateError::WrongPhase(_)
                | DebateError::InvalidEvent(_)
                | DebateError::SessionExists(_)
                | DebateError::SessionNotFound(_)
        )
    }
}
