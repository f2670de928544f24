//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::DebateError;
use crate::events::SessionId;
use crate::generation::{GenerationContext, SpeechGenerator};
use crate::persistence::{TranscriptRecord, TranscriptSink};
use crate::stream_client::{ProviderFrame, StreamConnection, StreamConnector, StreamError, TextSegment};
use crate::tts::BufferedSynthesizer;

/// One scripted provider behaviour.
#[derive(Debug, Clone)]
pub enum Step {
    Audio(u32, &'static [u8]),
    Done(u32),
    /// Abnormal close.
    Drop,
    /// Normal close.
    Close,
    /// Answer every sent segment with `audio-{id}` then its final marker. Never exhausts.
    EchoAll,
}

pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    sent: Arc<Mutex<Vec<Vec<TextSegment>>>>,
    attempts: AtomicUsize,
    refuse_first: AtomicUsize,
    refuse_after: AtomicUsize,
    first_send_limit: AtomicUsize,
}

impl ScriptedConnector {
    /// Each successful connect consumes the next script.
    pub fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            sent: Arc::new(Mutex::new(Vec::new())),
            attempts: AtomicUsize::new(0),
            refuse_first: AtomicUsize::new(0),
            refuse_after: AtomicUsize::new(usize::MAX),
            first_send_limit: AtomicUsize::new(usize::MAX),
        })
    }

    /// Fail the first `n` connect attempts.
    pub fn refuse_first(self: Arc<Self>, n: usize) -> Arc<Self> {
        self.refuse_first.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every connect once `n` connections have been opened.
    pub fn refuse_after(self: Arc<Self>, n: usize) -> Arc<Self> {
        self.refuse_after.store(n, Ordering::SeqCst);
        self
    }

    /// The first opened connection fails every send after `n` successful ones.
    pub fn fail_sends_after(self: Arc<Self>, n: usize) -> Arc<Self> {
        self.first_send_limit.store(n, Ordering::SeqCst);
        self
    }

    /// Connect attempts, successful or not.
    pub fn connects(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Segments sent on the `n`th opened connection.
    pub fn sent(&self, n: usize) -> Vec<TextSegment> {
        self.sent.lock().get(n).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, _voice_id: &str) -> Result<Box<dyn StreamConnection>, StreamError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let opened = self.sent.lock().len();
        if attempt < self.refuse_first.load(Ordering::SeqCst)
            || opened >= self.refuse_after.load(Ordering::SeqCst)
        {
            return Err(StreamError::Connect("connection refused".to_string()));
        }

        let steps = self.scripts.lock().pop_front().unwrap_or_default();
        let index = {
            let mut sent = self.sent.lock();
            sent.push(Vec::new());
            sent.len() - 1
        };
        Ok(Box::new(ScriptedConnection {
            steps: steps.into(),
            sent: self.sent.clone(),
            index,
            send_limit: if index == 0 {
                self.first_send_limit.load(Ordering::SeqCst)
            } else {
                usize::MAX
            },
            echoed: 0,
            echo_done_pending: false,
        }))
    }
}

struct ScriptedConnection {
    steps: VecDeque<Step>,
    sent: Arc<Mutex<Vec<Vec<TextSegment>>>>,
    index: usize,
    send_limit: usize,
    echoed: usize,
    echo_done_pending: bool,
}

#[async_trait]
impl StreamConnection for ScriptedConnection {
    async fn send(&mut self, segment: &TextSegment) -> Result<(), StreamError> {
        let mut sent = self.sent.lock();
        if sent[self.index].len() >= self.send_limit {
            return Err(StreamError::Closed {
                code: Some(1006),
                reason: "broken pipe".to_string(),
            });
        }
        sent[self.index].push(segment.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ProviderFrame, StreamError>> {
        match self.steps.front().cloned() {
            Some(Step::EchoAll) => {
                let next = self.sent.lock()[self.index].get(self.echoed).cloned();
                let Some(segment) = next else {
                    return std::future::pending().await;
                };
                if self.echo_done_pending {
                    self.echo_done_pending = false;
                    self.echoed += 1;
                    Some(Ok(ProviderFrame::SegmentDone {
                        segment_id: segment.id,
                    }))
                } else {
                    self.echo_done_pending = true;
                    Some(Ok(ProviderFrame::Audio {
                        segment_id: segment.id,
                        data: Bytes::from(format!("audio-{}", segment.id)),
                    }))
                }
            }
            Some(step) => {
                self.steps.pop_front();
                match step {
                    Step::Audio(segment_id, data) => Some(Ok(ProviderFrame::Audio {
                        segment_id,
                        data: Bytes::from_static(data),
                    })),
                    Step::Done(segment_id) => Some(Ok(ProviderFrame::SegmentDone { segment_id })),
                    Step::Drop => Some(Err(StreamError::Closed {
                        code: Some(1006),
                        reason: "abnormal closure".to_string(),
                    })),
                    Step::Close | Step::EchoAll => None,
                }
            }
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

/// Buffered synthesizer that records requests.
pub struct FakeBuffered {
    fail: bool,
    requests: Mutex<Vec<String>>,
}

impl FakeBuffered {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl BufferedSynthesizer for FakeBuffered {
    async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Bytes, DebateError> {
        self.requests.lock().push(text.to_string());
        if self.fail {
            return Err(DebateError::Synthesis("provider unavailable".to_string()));
        }
        Ok(Bytes::from(format!("buffer:{}", text.len())))
    }
}

/// Generator answering after a fixed delay, or failing.
pub struct ScriptedGenerator {
    delay: Duration,
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn replying(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Phase keys of every request, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SpeechGenerator for ScriptedGenerator {
    async fn generate(&self, context: &GenerationContext) -> Result<String, DebateError> {
        self.calls.lock().push(context.phase.key.clone());
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(DebateError::Generation {
                speaker: context.participant.name.clone(),
                reason: "model unavailable".to_string(),
            });
        }
        Ok(format!(
            "{} argues the {} on {}.",
            context.participant.name, context.phase.name, context.topic
        ))
    }
}

/// Sink that keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TranscriptRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<TranscriptRecord> {
        self.records.lock().clone()
    }

    pub fn for_session(&self, session_id: &SessionId) -> Option<TranscriptRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| &r.session_id == session_id)
            .cloned()
    }
}

#[async_trait]
impl TranscriptSink for MemorySink {
    async fn persist(&self, record: &TranscriptRecord) -> Result<(), DebateError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
