//! DebateArena Core Library
//!
//! Real-time debate sessions: phase/turn orchestration, per-session timers,
//! AI speech generation and audio delivery, and the transport layer that
//! carries the event protocol to connected clients.

pub mod audio;
pub mod config;
pub mod debate_format;
pub mod error;
pub mod events;
pub mod generation;
pub mod orchestrator;
pub mod participant;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod state;
pub mod stream_client;
pub mod transport;
pub mod tts;

#[cfg(test)]
mod testing;

pub use audio::{AudioJob, AudioOutput, AudioPipeline, DeliveryMode};
pub use config::{Config, default_config};
pub use debate_format::{DebateFormat, PhaseDefinition, PhaseSpeaker, PublicForumFormat};
pub use error::DebateError;
pub use events::{ClientEvent, ServerEvent, SessionId, StartDebate};
pub use generation::{ApiConfig, GenerationContext, OpenAiGenerator, SpeechGenerator};
pub use orchestrator::{DebateOrchestrator, Effect, OrchestratorSettings};
pub use participant::{Participant, ParticipantId, SpeakerSlot, Team};
pub use persistence::{DiscardSink, JsonFileSink, TranscriptRecord, TranscriptSink};
pub use registry::SessionRegistry;
pub use session::{SessionContext, SessionHandle, SessionView};
pub use state::{DebatePhase, DebateState, Outcome, StateSnapshot, TranscriptEntry};
pub use stream_client::{ReconnectPolicy, ReconnectingStreamClient, WebSocketConnector};
pub use transport::{ChannelTransport, ConnectionId, PresenceEvent, SocketTransport, Subscription, Transport};
pub use tts::{BufferedSynthesizer, HttpSynthesizer, KokoroSynthesizer};
