//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debate_format::{self, ConfiguredFormat, DebateFormat, PhaseSpeaker};
use crate::error::DebateError;
use crate::participant::{SpeakerSlot, Team};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub timing: TimingConfig,
    pub streaming: StreamingConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub voices: VoicesConfig,
    pub prompts: PromptsConfig,
    /// Custom formats; a format here shadows a built-in with the same name.
    pub formats: Vec<FormatConfig>,
}

/// Which transport backend carries the event protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One bidirectional socket per connection.
    #[default]
    Socket,
    /// Managed broadcast channel per session with presence tracking.
    Channel,
}

/// Hosting process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub transport: TransportKind,
    pub max_sessions: usize,
    /// How long a session survives with zero members before teardown.
    pub grace_period_secs: u64,
    /// Directory for finished transcripts; transcripts are discarded when unset.
    pub transcript_dir: Option<PathBuf>,
    /// Outbound events buffered per connection before it counts as too slow.
    pub connection_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            transport: TransportKind::Socket,
            max_sessions: 64,
            grace_period_secs: 10,
            transcript_dir: None,
            connection_queue: 256,
        }
    }
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Phase clock settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub format: String,
    pub tick_interval_ms: u64,
    /// Multiplier applied to built-in phase durations.
    pub time_scale: f32,
    /// Advance to the next phase as soon as the speaker submits.
    pub end_phase_on_submit: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            format: "public_forum".to_string(),
            tick_interval_ms: 1000,
            time_scale: 1.0,
            end_phase_on_submit: true,
        }
    }
}

impl TimingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Streaming synthesis connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub max_reconnect_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Maximum characters per text segment sent to the provider.
    pub segment_chars: usize,
    /// Capacity of the per-job audio output channel.
    pub chunk_buffer: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reconnect_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            connect_timeout_ms: 5000,
            segment_chars: 200,
            chunk_buffer: 64,
        }
    }
}

/// Language-model settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Fallback line appended when generation fails; `{name}` is replaced.
    pub fallback_text: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            fallback_text: "{name} yields the remainder of this time to the opposing side."
                .to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn fallback_for(&self, name: &str) -> String {
        self.fallback_text.replace("{name}", name)
    }
}

/// Which single-shot synthesis backend serves the buffered path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisProvider {
    /// Remote HTTP text-to-speech API.
    #[default]
    Http,
    /// Local kokoro-tiny engine.
    Kokoro,
    /// No audio; AI speeches are broadcast as text only.
    None,
}

impl SynthesisProvider {
    /// Voice used for a team when `[voices]` leaves it unset.
    pub fn default_voice(self, team: Team) -> &'static str {
        match (self, team) {
            (SynthesisProvider::Kokoro, Team::Pro) => "bf_emma",
            (SynthesisProvider::Kokoro, Team::Con) => "bm_george",
            (SynthesisProvider::Http | SynthesisProvider::None, Team::Pro) => "21m00Tcm4TlvDq8ikWAM",
            (SynthesisProvider::Http | SynthesisProvider::None, Team::Con) => "pNInz6obpgDQGcFmaJgB",
        }
    }
}

/// Speech synthesis provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub provider: SynthesisProvider,
    /// HTTP base of the provider, e.g. `https://api.elevenlabs.io/v1`.
    pub api_base: String,
    /// WebSocket base of the streaming endpoint.
    pub ws_base: String,
    pub model_id: String,
    pub output_format: String,
    pub request_timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: SynthesisProvider::Http,
            api_base: "https://api.elevenlabs.io/v1".to_string(),
            ws_base: "wss://api.elevenlabs.io/v1".to_string(),
            model_id: "eleven_flash_v2_5".to_string(),
            output_format: "mp3_44100_128".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Voice configuration for TTS. Unset voices follow the synthesis provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VoicesConfig {
    pub pro_voice: Option<String>,
    pub con_voice: Option<String>,
}

/// System prompts configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub pro_prompt: String,
    pub con_prompt: String,
    /// User turn sent for each AI speech; `{phase_name}` and `{phase_description}` are replaced.
    pub turn_template: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            pro_prompt: DEFAULT_PRO_PROMPT.to_string(),
            con_prompt: DEFAULT_CON_PROMPT.to_string(),
            turn_template: "[{phase_name} - {phase_description}]\nPlease deliver your {phase_name}."
                .to_string(),
        }
    }
}

/// A custom debate format.
#[derive(Debug, Clone, Deserialize)]
pub struct FormatConfig {
    pub name: String,
    pub display_name: String,
    /// Slots each team fills.
    pub slots: Vec<SpeakerSlot>,
    pub phases: Vec<PhaseConfig>,
}

/// Configuration for a single phase.
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseConfig {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub duration_secs: u32,
    pub speaker: PhaseSpeaker,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    350
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DebateError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| DebateError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, DebateError> {
        toml::from_str(content)
            .map_err(|e| DebateError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Resolve the configured debate format, custom formats first.
    pub fn format(&self) -> Result<Box<dyn DebateFormat>, DebateError> {
        let name = self.timing.format.as_str();
        if let Some(custom) = self.formats.iter().find(|f| f.name == name) {
            return Ok(Box::new(ConfiguredFormat::new(custom.clone(), self.timing.time_scale)?));
        }
        debate_format::get_format(name, self.timing.time_scale)
            .ok_or_else(|| DebateError::UnknownFormat(name.to_string()))
    }

    /// Get the system prompt for a participant, with placeholders replaced.
    pub fn get_prompt(&self, team: Team, name: &str, topic: &str, opponent_name: &str) -> String {
        let template = match team {
            Team::Pro => &self.prompts.pro_prompt,
            Team::Con => &self.prompts.con_prompt,
        };

        template
            .replace("{name}", name)
            .replace("{topic}", topic)
            .replace("{opponent_name}", opponent_name)
    }

    /// Get voice ID for a team.
    pub fn get_voice(&self, team: Team) -> &str {
        let configured = match team {
            Team::Pro => self.voices.pro_voice.as_deref(),
            Team::Con => self.voices.con_voice.as_deref(),
        };
        configured.unwrap_or_else(|| self.synthesis.provider.default_voice(team))
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config::default()
}

const DEFAULT_PRO_PROMPT: &str = r#"You are {name} participating in a live, timed debate.

DEBATE TOPIC: {topic}

YOUR POSITION: You are arguing IN FAVOR of the topic.
YOUR OPPONENTS: {opponent_name}

DEBATE RULES:
- Present clear, compelling arguments supported by evidence and reasoning
- Address the specific question or topic directly
- Acknowledge and counter your opponents' arguments respectfully
- Keep each speech short enough to be spoken within the phase time
- Do NOT acknowledge being an AI - stay fully in character

CRITICAL OUTPUT RULES:
- Output ONLY your spoken words - no scene directions or stage actions
- Do NOT include any text in parentheses like "(Steps to podium)"
- Do NOT include asterisks for emphasis or any markdown formatting
"#;

const DEFAULT_CON_PROMPT: &str = r#"You are {name} participating in a live, timed debate.

DEBATE TOPIC: {topic}

YOUR POSITION: You are arguing AGAINST the topic.
YOUR OPPONENTS: {opponent_name}

DEBATE RULES:
- Present clear, compelling arguments supported by evidence and reasoning
- Address the specific question or topic directly
- Acknowledge and counter your opponents' arguments respectfully
- Keep each speech short enough to be spoken within the phase time
- Do NOT acknowledge being an AI - stay fully in character

CRITICAL OUTPUT RULES:
- Output ONLY your spoken words - no scene directions or stage actions
- Do NOT include any text in parentheses like "(Steps to podium)"
- Do NOT include asterisks for emphasis or any markdown formatting
"#;
