//! Speech generation through an OpenAI-compatible chat completion API.

use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::debate_format::PhaseDefinition;
use crate::error::DebateError;
use crate::events::SessionId;
use crate::participant::Participant;
use crate::state::TranscriptEntry;

/// Everything the language model needs to produce one speech.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub session_id: SessionId,
    pub topic: String,
    pub participant: Participant,
    /// Names of the opposing team.
    pub opponents: Vec<String>,
    pub phase: PhaseDefinition,
    /// Transcript at the moment the request was issued.
    pub transcript: Vec<TranscriptEntry>,
}

/// Produces the next speech for an AI participant.
#[async_trait]
pub trait SpeechGenerator: Send + Sync {
    async fn generate(&self, context: &GenerationContext) -> Result<String, DebateError>;
}

/// API connection settings for the OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// OpenAI-compatible API base URL.
    pub api_base: String,
    /// API key for authentication.
    pub api_key: String,
}

impl ApiConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
        }
    }
}

/// Generator backed by `async-openai`.
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    config: Config,
}

impl OpenAiGenerator {
    pub fn new(api: ApiConfig, config: Config) -> Result<Self, DebateError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.generation.timeout())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                DebateError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(&api.api_key)
            .with_api_base(&api.api_base);

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            config,
        })
    }

    /// Build the chat history for one turn: system prompt, prior speeches, phase prompt.
    pub fn build_messages(&self, context: &GenerationContext) -> Vec<ChatCompletionRequestMessage> {
        let participant = &context.participant;
        let opponents = if context.opponents.is_empty() {
            "Opponent".to_string()
        } else {
            context.opponents.join(" and ")
        };
        let system_prompt = participant.custom_system_prompt.clone().unwrap_or_else(|| {
            self.config
                .get_prompt(participant.team, &participant.name, &context.topic, &opponents)
        });

        let mut messages = vec![ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessage {
                content: system_prompt.into(),
                name: None,
            },
        )];

        for entry in &context.transcript {
            if entry.participant_id == participant.id {
                messages.push(ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessage {
                        content: Some(entry.text.clone().into()),
                        name: None,
                        tool_calls: None,
                        refusal: None,
                        audio: None,
                        function_call: None,
                    },
                ));
            } else {
                messages.push(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage {
                        content: format!("[{} said]: {}", entry.speaker_name, entry.text).into(),
                        name: None,
                    },
                ));
            }
        }

        let turn_prompt = self
            .config
            .prompts
            .turn_template
            .replace("{phase_name}", &context.phase.name)
            .replace("{phase_description}", &context.phase.description);
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: turn_prompt.into(),
                name: None,
            },
        ));

        messages
    }

    async fn get_completion(&self, context: &GenerationContext) -> Result<String, DebateError> {
        let model = context
            .participant
            .model
            .clone()
            .unwrap_or_else(|| self.config.generation.model.clone());

        let request = CreateChatCompletionRequestArgs::default()
            .model(&model)
            .max_completion_tokens(context.phase.max_tokens)
            .messages(self.build_messages(context))
            .build()?;

        // Retry logic with exponential backoff
        let max_retries = self.config.generation.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << attempt.min(5));
                tokio::time::sleep(delay).await;
            }

            match self.client.chat().create(request.clone()).await {
                Ok(response) => {
                    let content = response
                        .choices
                        .first()
                        .and_then(|c| c.message.content.clone())
                        .unwrap_or_default();
                    if content.trim().len() > 10 {
                        return Ok(content);
                    }
                    warn!(
                        session_id = %context.session_id,
                        speaker = %context.participant.name,
                        attempt = attempt + 1,
                        "Empty response from model, retrying"
                    );
                }
                Err(e) => {
                    warn!(
                        session_id = %context.session_id,
                        speaker = %context.participant.name,
                        attempt = attempt + 1,
                        error = %e,
                        "Completion request failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map(DebateError::from).unwrap_or_else(|| DebateError::Generation {
            speaker: context.participant.name.clone(),
            reason: format!("empty response after {} attempts", max_retries),
        }))
    }
}

#[async_trait]
impl SpeechGenerator for OpenAiGenerator {
    async fn generate(&self, context: &GenerationContext) -> Result<String, DebateError> {
        debug!(
            session_id = %context.session_id,
            phase = %context.phase.key,
            speaker = %context.participant.name,
            "Requesting speech"
        );
        self.get_completion(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::debate_format::{DebateFormat, PublicForumFormat};
    use crate::participant::{SpeakerSlot, Team};
    use chrono::Utc;

    fn context() -> GenerationContext {
        let participant = Participant::ai("p2", "Pro Bot", Team::Pro, SpeakerSlot::Second);
        GenerationContext {
            session_id: "s1".to_string(),
            topic: "X".to_string(),
            participant,
            opponents: vec!["Grace".to_string(), "Con Bot".to_string()],
            phase: PublicForumFormat::default().phases()[3].clone(),
            transcript: vec![
                TranscriptEntry {
                    participant_id: "c1".to_string(),
                    speaker_name: "Grace".to_string(),
                    phase: "con_constructive".to_string(),
                    text: "X is bad.".to_string(),
                    timestamp: Utc::now(),
                    fallback: false,
                },
                TranscriptEntry {
                    participant_id: "p2".to_string(),
                    speaker_name: "Pro Bot".to_string(),
                    phase: "first_crossfire".to_string(),
                    text: "Why?".to_string(),
                    timestamp: Utc::now(),
                    fallback: false,
                },
            ],
        }
    }

    fn generator() -> OpenAiGenerator {
        OpenAiGenerator::new(
            ApiConfig::new("http://127.0.0.1:9/v1", "test-key"),
            default_config(),
        )
        .unwrap()
    }

    #[test]
    fn test_build_messages_orders_history() {
        let messages = generator().build_messages(&context());
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(messages[3], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_custom_system_prompt_wins() {
        let mut ctx = context();
        ctx.participant = ctx.participant.with_system_prompt("Be brief.");
        let messages = generator().build_messages(&ctx);
        let ChatCompletionRequestMessage::System(system) = &messages[0] else {
            panic!("first message must be the system prompt");
        };
        let json = serde_json::to_string(&system.content).unwrap();
        assert!(json.contains("Be brief."));
    }
}
