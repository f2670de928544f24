//! Buffered text-to-speech: the whole speech rendered into one audio payload.
//!
//! Used directly in buffered delivery mode and as the fallback when the
//! streaming provider cannot be reached.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kokoro_tiny::TtsEngine;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::config::SynthesisConfig;
use crate::error::DebateError;

/// Kokoro renders at 24kHz mono.
const KOKORO_SAMPLE_RATE: u32 = 24_000;
/// 0.3s pause between chunks
const CHUNK_PAUSE_SAMPLES: usize = 7_200;
/// 0.5s trailing padding
const TRAILING_PAD_SAMPLES: usize = 12_000;

#[async_trait]
pub trait BufferedSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Bytes, DebateError>;
}

/// Synthesizer for ElevenLabs-compatible `text-to-speech/{voice}` endpoints.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model_id: String,
    output_format: String,
}

impl HttpSynthesizer {
    pub fn new(config: &SynthesisConfig, api_key: impl Into<String>) -> Result<Self, DebateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DebateError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model_id: config.model_id.clone(),
            output_format: config.output_format.clone(),
        })
    }
}

#[async_trait]
impl BufferedSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Bytes, DebateError> {
        let url = format!("{}/text-to-speech/{}", self.api_base, voice_id);
        debug!(voice_id, chars = text.len(), "Requesting buffered synthesis");

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", self.output_format.as_str())])
            .header("xi-api-key", &self.api_key)
            .json(&json!({ "text": text, "model_id": self.model_id }))
            .send()
            .await
            .map_err(|e| DebateError::Synthesis(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DebateError::Synthesis(format!(
                "Provider returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| DebateError::Synthesis(format!("Failed to read audio: {}", e)))
    }
}

/// Local synthesizer using kokoro-tiny; output is a WAV file.
pub struct KokoroSynthesizer {
    engine: Arc<Mutex<TtsEngine>>,
    available_voices: Vec<String>,
}

impl KokoroSynthesizer {
    /// Initialize the TTS engine (downloads model on first run).
    pub async fn new() -> Result<Self, DebateError> {
        let engine = TtsEngine::new()
            .await
            .map_err(|e| DebateError::Synthesis(format!("Failed to initialize TTS: {}", e)))?;
        let available_voices = engine.voices();

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            available_voices,
        })
    }

    /// Validate that a voice ID exists.
    pub fn validate_voice(&self, voice_id: &str) -> Result<(), DebateError> {
        if voice_id.is_empty() {
            return Err(DebateError::Synthesis(format!(
                "Voice ID cannot be empty. Available voices:\n{}",
                format_voices(&self.available_voices)
            )));
        }

        if !self.available_voices.iter().any(|v| v == voice_id) {
            return Err(DebateError::Synthesis(format!(
                "Unknown voice '{}'. Available voices:\n{}",
                voice_id,
                format_voices(&self.available_voices)
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl BufferedSynthesizer for KokoroSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Bytes, DebateError> {
        self.validate_voice(voice_id)?;

        // Kokoro has a ~200 char safe limit per call
        let chunks = split_into_chunks(text, 200);
        let voice_id = voice_id.to_string();
        let samples = render_blocking(self.engine.clone(), chunks, move |engine, chunk| {
            engine.synthesize(chunk, Some(voice_id.as_str())).map_err(|e| e.to_string())
        })
        .await?;

        encode_wav(&samples, KOKORO_SAMPLE_RATE)
    }
}

/// Render `chunks` on the blocking pool, holding the engine for the whole speech.
async fn render_blocking<E, F>(
    engine: Arc<Mutex<E>>,
    chunks: Vec<String>,
    render: F,
) -> Result<Vec<f32>, DebateError>
where
    E: Send + 'static,
    F: Fn(&mut E, &str) -> Result<Vec<f32>, String> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut engine = engine.lock();
        let mut samples = Vec::new();
        for chunk in &chunks {
            let rendered = render(&mut engine, chunk)
                .map_err(|e| DebateError::Synthesis(format!("Synthesis failed: {}", e)))?;
            samples.extend(rendered);
            samples.extend(std::iter::repeat_n(0.0, CHUNK_PAUSE_SAMPLES));
        }
        samples.extend(std::iter::repeat_n(0.0, TRAILING_PAD_SAMPLES));
        Ok(samples)
    })
    .await
    .map_err(|e| DebateError::Synthesis(format!("Synthesis task failed: {}", e)))?
}

fn format_voices(voices: &[String]) -> String {
    let mut english_voices: Vec<&String> = voices
        .iter()
        .filter(|v| {
            v.starts_with("af_") || v.starts_with("am_") || v.starts_with("bf_") || v.starts_with("bm_")
        })
        .collect();
    english_voices.sort();

    english_voices
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Encode mono float samples as a 32-bit float WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Bytes, DebateError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let wav_error = |e: hound::Error| DebateError::Synthesis(format!("Failed to encode WAV: {}", e));

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)?;

    Ok(Bytes::from(cursor.into_inner()))
}

/// Split text into chunks at sentence boundaries, falling back to commas
/// for sentences longer than `max_chars`.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();

    for sentence in text.split_inclusive(&['.', '!', '?', ';'][..]) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        if current_chunk.len() + sentence.len() > max_chars {
            if !current_chunk.trim().is_empty() {
                chunks.push(current_chunk.trim().to_string());
            }
            current_chunk = String::new();

            if sentence.len() > max_chars {
                for part in sentence.split_inclusive(',') {
                    if current_chunk.len() + part.len() > max_chars && !current_chunk.trim().is_empty() {
                        chunks.push(current_chunk.trim().to_string());
                        current_chunk = String::new();
                    }
                    current_chunk.push_str(part.trim());
                    current_chunk.push(' ');
                }
            } else {
                current_chunk.push_str(sentence);
                current_chunk.push(' ');
            }
        } else {
            current_chunk.push_str(sentence);
            current_chunk.push(' ');
        }
    }

    if !current_chunk.trim().is_empty() {
        chunks.push(current_chunk.trim().to_string());
    }

    chunks
}
