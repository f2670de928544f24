//! Where finished transcripts go.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::DebateError;
use crate::events::SessionId;
use crate::participant::Participant;
use crate::state::{Outcome, TranscriptEntry};

/// A finished debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    pub session_id: SessionId,
    pub topic: String,
    pub format: String,
    pub participants: Vec<Participant>,
    pub outcome: Outcome,
    pub transcript: Vec<TranscriptEntry>,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn persist(&self, record: &TranscriptRecord) -> Result<(), DebateError>;
}

/// Writes one pretty-printed JSON file per session.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl TranscriptSink for JsonFileSink {
    async fn persist(&self, record: &TranscriptRecord) -> Result<(), DebateError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(generate_output_filename(&record.topic, &record.session_id));
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, json).await?;
        info!(session_id = %record.session_id, path = %path.display(), "Transcript saved");
        Ok(())
    }
}

/// Drops every transcript.
pub struct DiscardSink;

#[async_trait]
impl TranscriptSink for DiscardSink {
    async fn persist(&self, record: &TranscriptRecord) -> Result<(), DebateError> {
        debug!(session_id = %record.session_id, entries = record.transcript.len(), "Transcript discarded");
        Ok(())
    }
}

fn sanitize(name: &str, max_len: usize) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();
    sanitized.trim().to_string()
}

/// Generate the transcript filename for a session.
pub fn generate_output_filename(topic: &str, session_id: &str) -> String {
    format!(
        "DebateArena - {} - {}.json",
        sanitize(topic, 50),
        sanitize(session_id, 64)
    )
}
