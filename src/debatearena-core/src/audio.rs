//! Audio delivery for AI speeches.
//!
//! A job's text is split into segments and streamed through the reconnecting
//! client. Audio is held per segment until the provider finalizes that
//! segment, so a mid-segment drop never leaks a partial copy downstream.
//! Whatever streaming could not deliver is rendered by the buffered
//! synthesizer. Every job ends with exactly one `AudioOutput::End`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use crate::error::DebateError;
use crate::events::{JobId, ServerEvent, SessionId};
use crate::participant::ParticipantId;
use crate::stream_client::{
    ReconnectPolicy, ReconnectingStreamClient, StreamConnector, StreamError, StreamFrame,
    TextSegment,
};
use crate::transport::Transport;
use crate::tts::{BufferedSynthesizer, split_into_chunks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Chunks as the provider renders them.
    Stream,
    /// One buffer per speech.
    Buffer,
}

#[derive(Debug, Clone)]
pub struct AudioJob {
    pub job_id: JobId,
    pub participant_id: ParticipantId,
    pub speaker_name: String,
    pub voice_id: String,
    pub text: String,
    pub mode: DeliveryMode,
}

#[derive(Debug)]
pub enum AudioOutput {
    Chunk { seq: u32, data: Bytes },
    Buffer(Bytes),
    Failed(DebateError),
    End,
}

/// Why the streaming path stopped early.
enum StreamStop {
    /// Downstream went away or the job was cancelled; nothing more to emit.
    Cancelled,
    /// Provider unusable; `delivered` segments reached the caller.
    Failed { delivered: usize, error: StreamError },
}

#[derive(Clone)]
pub struct AudioPipeline {
    connector: Option<Arc<dyn StreamConnector>>,
    buffered: Option<Arc<dyn BufferedSynthesizer>>,
    policy: ReconnectPolicy,
    segment_chars: usize,
    chunk_buffer: usize,
}

impl AudioPipeline {
    pub fn new(
        connector: Option<Arc<dyn StreamConnector>>,
        buffered: Option<Arc<dyn BufferedSynthesizer>>,
        config: &StreamingConfig,
    ) -> Self {
        Self {
            connector: connector.filter(|_| config.enabled),
            buffered,
            policy: ReconnectPolicy::from(config),
            segment_chars: config.segment_chars.max(1),
            chunk_buffer: config.chunk_buffer.max(1),
        }
    }

    /// Whether any synthesis path is available.
    pub fn is_available(&self) -> bool {
        self.connector.is_some() || self.buffered.is_some()
    }

    /// Run one job in the background. The receiver yields the job's outputs
    /// and closes after `AudioOutput::End`.
    pub fn start(&self, job: AudioJob, cancel: CancellationToken) -> mpsc::Receiver<AudioOutput> {
        let (tx, rx) = mpsc::channel(self.chunk_buffer);
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run(job, tx, cancel).await;
        });
        rx
    }

    async fn run(&self, job: AudioJob, tx: mpsc::Sender<AudioOutput>, cancel: CancellationToken) {
        if let Err(e) = self.deliver(&job, &tx, &cancel).await {
            if !cancel.is_cancelled() {
                warn!(job_id = %job.job_id, speaker = %job.speaker_name, error = %e, "Audio delivery failed");
                let _ = tx.send(AudioOutput::Failed(e)).await;
            }
        }
        let _ = tx.send(AudioOutput::End).await;
        debug!(job_id = %job.job_id, "Audio job finished");
    }

    async fn deliver(
        &self,
        job: &AudioJob,
        tx: &mpsc::Sender<AudioOutput>,
        cancel: &CancellationToken,
    ) -> Result<(), DebateError> {
        let segments: Vec<TextSegment> = split_into_chunks(&job.text, self.segment_chars)
            .into_iter()
            .enumerate()
            .map(|(id, text)| TextSegment { id: id as u32, text })
            .collect();
        if segments.is_empty() {
            return Ok(());
        }

        let connector = match (&self.connector, job.mode, &self.buffered) {
            (Some(connector), DeliveryMode::Stream, _) | (Some(connector), _, None) => connector,
            _ => return self.buffer(job, &segments, tx, cancel).await,
        };

        match self.stream(connector, job, &segments, tx, cancel).await {
            Ok(()) => Ok(()),
            Err(StreamStop::Cancelled) => Ok(()),
            Err(StreamStop::Failed { delivered, error }) => {
                info!(
                    job_id = %job.job_id,
                    delivered,
                    remaining = segments.len() - delivered,
                    error = %error,
                    "Streaming synthesis unavailable, falling back to buffered"
                );
                if self.buffered.is_none() {
                    return Err(match error {
                        StreamError::Exhausted { attempts } => DebateError::TransportDisconnect { attempts },
                        error => DebateError::Synthesis(format!(
                            "streaming failed ({}) and no buffered synthesizer is configured",
                            error
                        )),
                    });
                }
                self.buffer(job, &segments[delivered..], tx, cancel).await
            }
        }
    }

    async fn buffer(
        &self,
        job: &AudioJob,
        segments: &[TextSegment],
        tx: &mpsc::Sender<AudioOutput>,
        cancel: &CancellationToken,
    ) -> Result<(), DebateError> {
        let Some(buffered) = &self.buffered else {
            return Err(DebateError::Synthesis("no synthesizer is configured".to_string()));
        };
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let audio = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            audio = buffered.synthesize(&text, &job.voice_id) => audio?,
        };
        let _ = tx.send(AudioOutput::Buffer(audio)).await;
        Ok(())
    }

    async fn stream(
        &self,
        connector: &Arc<dyn StreamConnector>,
        job: &AudioJob,
        segments: &[TextSegment],
        tx: &mpsc::Sender<AudioOutput>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamStop> {
        let mut client = ReconnectingStreamClient::new(
            connector.clone(),
            job.voice_id.clone(),
            self.policy,
            cancel.child_token(),
        );
        let mut delivered = 0;
        let fail = |delivered: usize, error: StreamError| match error {
            StreamError::Cancelled => StreamStop::Cancelled,
            error => StreamStop::Failed { delivered, error },
        };

        client.connect().await.map_err(|e| fail(0, e))?;
        for segment in segments {
            client.send(segment.clone()).await.map_err(|e| fail(0, e))?;
        }

        let mut seq = 0u32;
        let mut held: BTreeMap<u32, Vec<Bytes>> = BTreeMap::new();
        while delivered < segments.len() {
            let frame = match client.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Err(fail(
                        delivered,
                        StreamError::Closed {
                            code: None,
                            reason: "provider closed before every segment was rendered".to_string(),
                        },
                    ));
                }
                Err(e) => return Err(fail(delivered, e)),
            };

            match frame {
                StreamFrame::Audio { segment_id, data } => {
                    held.entry(segment_id).or_default().push(data);
                }
                StreamFrame::SegmentDone { segment_id } => {
                    if segment_id != segments[delivered].id {
                        return Err(fail(
                            delivered,
                            StreamError::Protocol(format!(
                                "expected segment {} to finish, got {}",
                                segments[delivered].id, segment_id
                            )),
                        ));
                    }
                    for data in held.remove(&segment_id).unwrap_or_default() {
                        if tx.send(AudioOutput::Chunk { seq, data }).await.is_err() {
                            return Err(StreamStop::Cancelled);
                        }
                        seq += 1;
                    }
                    delivered += 1;
                }
                StreamFrame::Resumed => {
                    debug!(
                        job_id = %job.job_id,
                        attempts = client.attempts(),
                        discarded = held.len(),
                        "Stream resumed, discarding partial segments"
                    );
                    held.clear();
                }
            }
        }

        client.close().await;
        Ok(())
    }
}

/// Consume a session's audio jobs in FIFO order and publish their output.
pub async fn run_audio_worker(
    session_id: SessionId,
    pipeline: Arc<AudioPipeline>,
    mut jobs: mpsc::UnboundedReceiver<AudioJob>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let job_id = job.job_id;
        debug!(%session_id, %job_id, speaker = %job.speaker_name, mode = ?job.mode, "Starting audio job");

        let mut outputs = pipeline.start(job, cancel.child_token());
        while let Some(output) = outputs.recv().await {
            let event = match output {
                AudioOutput::Chunk { seq, data } => ServerEvent::AiSpeechAudioChunk {
                    job_id,
                    seq,
                    audio: data,
                },
                AudioOutput::Buffer(audio) => ServerEvent::AiSpeechAudio { job_id, audio },
                AudioOutput::Failed(e) => ServerEvent::error(&e),
                AudioOutput::End => ServerEvent::AiSpeechAudioEnd { job_id },
            };
            if let Err(e) = transport.publish(&session_id, event).await {
                warn!(%session_id, %job_id, error = %e, "Failed to publish audio event");
            }
        }
    }
    debug!(%session_id, "Audio worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBuffered, ScriptedConnector, Step};
    use uuid::Uuid;

    const TEXT: &str = "First sentence here. Second sentence here. Third sentence here.";

    fn config() -> StreamingConfig {
        StreamingConfig {
            segment_chars: 25,
            base_delay_ms: 100,
            max_delay_ms: 400,
            ..StreamingConfig::default()
        }
    }

    fn job(mode: DeliveryMode) -> AudioJob {
        AudioJob {
            job_id: Uuid::new_v4(),
            participant_id: "p2".to_string(),
            speaker_name: "Pro Bot".to_string(),
            voice_id: "voice".to_string(),
            text: TEXT.to_string(),
            mode,
        }
    }

    async fn collect(pipeline: &AudioPipeline, job: AudioJob) -> Vec<AudioOutput> {
        let mut rx = pipeline.start(job, CancellationToken::new());
        let mut outputs = Vec::new();
        while let Some(output) = rx.recv().await {
            outputs.push(output);
        }
        outputs
    }

    fn ends(outputs: &[AudioOutput]) -> usize {
        outputs.iter().filter(|o| matches!(o, AudioOutput::End)).count()
    }

    fn chunks(outputs: &[AudioOutput]) -> Vec<(u32, Bytes)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                AudioOutput::Chunk { seq, data } => Some((*seq, data.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_segments_in_order_with_one_end() {
        let connector = ScriptedConnector::new(vec![vec![Step::EchoAll]]);
        let pipeline = AudioPipeline::new(Some(connector), None, &config());
        let outputs = collect(&pipeline, job(DeliveryMode::Stream)).await;

        assert_eq!(
            chunks(&outputs),
            vec![
                (0, Bytes::from("audio-0")),
                (1, Bytes::from("audio-1")),
                (2, Bytes::from("audio-2")),
            ]
        );
        assert!(matches!(outputs.last(), Some(AudioOutput::End)));
        assert_eq!(ends(&outputs), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_segment_drop_neither_duplicates_nor_drops() {
        // Segment 0 completes, segment 1 drops half-way; the retry re-renders 1 and 2.
        let connector = ScriptedConnector::new(vec![
            vec![
                Step::Audio(0, b"audio-0"),
                Step::Done(0),
                Step::Audio(1, b"partial-1"),
                Step::Drop,
            ],
            vec![Step::EchoAll],
        ]);
        let pipeline = AudioPipeline::new(Some(connector.clone()), None, &config());
        let outputs = collect(&pipeline, job(DeliveryMode::Stream)).await;

        assert_eq!(
            chunks(&outputs),
            vec![
                (0, Bytes::from("audio-0")),
                (1, Bytes::from("audio-1")),
                (2, Bytes::from("audio-2")),
            ]
        );
        assert_eq!(connector.sent(1).iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ends(&outputs), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_stream_falls_back_to_buffer_for_remainder() {
        let connector = ScriptedConnector::new(vec![vec![
            Step::Audio(0, b"audio-0"),
            Step::Done(0),
            Step::Drop,
        ]])
        .refuse_after(1);
        let buffered = FakeBuffered::ok();
        let pipeline = AudioPipeline::new(Some(connector), Some(buffered.clone()), &config());
        let outputs = collect(&pipeline, job(DeliveryMode::Stream)).await;

        assert_eq!(chunks(&outputs), vec![(0, Bytes::from("audio-0"))]);
        assert_eq!(
            buffered.requests(),
            vec!["Second sentence here. Third sentence here.".to_string()]
        );
        assert!(matches!(outputs[1], AudioOutput::Buffer(_)));
        assert!(matches!(outputs[2], AudioOutput::End));
        assert_eq!(outputs.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_paths_failing_reports_error_then_end() {
        let connector = ScriptedConnector::new(vec![]).refuse_after(0);
        let pipeline = AudioPipeline::new(Some(connector), Some(FakeBuffered::failing()), &config());
        let outputs = collect(&pipeline, job(DeliveryMode::Stream)).await;

        assert_eq!(outputs.len(), 2);
        assert!(matches!(outputs[0], AudioOutput::Failed(DebateError::Synthesis(_))));
        assert!(matches!(outputs[1], AudioOutput::End));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_stream_without_buffer_reports_disconnect() {
        let connector = ScriptedConnector::new(vec![]).refuse_after(0);
        let pipeline = AudioPipeline::new(Some(connector.clone()), None, &config());
        let outputs = collect(&pipeline, job(DeliveryMode::Stream)).await;

        assert!(matches!(
            outputs[0],
            AudioOutput::Failed(DebateError::TransportDisconnect { attempts: 3 })
        ));
        assert!(matches!(outputs[1], AudioOutput::End));
        assert_eq!(connector.connects(), 4);
    }

    #[tokio::test]
    async fn test_buffer_mode_skips_streaming() {
        let connector = ScriptedConnector::new(vec![vec![Step::EchoAll]]);
        let buffered = FakeBuffered::ok();
        let pipeline =
            AudioPipeline::new(Some(connector.clone()), Some(buffered.clone()), &config());
        let outputs = collect(&pipeline, job(DeliveryMode::Buffer)).await;

        assert_eq!(connector.connects(), 0);
        assert_eq!(buffered.requests(), vec![TEXT.to_string()]);
        assert!(matches!(outputs[0], AudioOutput::Buffer(_)));
        assert!(matches!(outputs[1], AudioOutput::End));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_still_ends() {
        let connector = ScriptedConnector::new(vec![vec![]]);
        let pipeline = AudioPipeline::new(Some(connector), None, &config());
        let cancel = CancellationToken::new();
        let mut rx = pipeline.start(job(DeliveryMode::Stream), cancel.clone());
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(rx.recv().await, Some(AudioOutput::End)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_publishes_jobs_fifo() {
        use crate::transport::{SocketTransport, Transport};

        let transport: Arc<dyn Transport> = Arc::new(SocketTransport::new(64));
        let listener = Uuid::new_v4();
        let mut sub = transport.connect(listener).await;
        transport.subscribe("s1", listener).await.unwrap();

        let connector = ScriptedConnector::new(vec![vec![Step::EchoAll], vec![Step::EchoAll]]);
        let pipeline = Arc::new(AudioPipeline::new(Some(connector), None, &config()));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (first, second) = (job(DeliveryMode::Stream), job(DeliveryMode::Stream));
        jobs_tx.send(first.clone()).unwrap();
        jobs_tx.send(second.clone()).unwrap();
        drop(jobs_tx);

        run_audio_worker(
            "s1".to_string(),
            pipeline,
            jobs_rx,
            transport,
            CancellationToken::new(),
        )
        .await;

        let mut order = Vec::new();
        while let Some(event) = sub.try_recv() {
            match event.as_ref() {
                ServerEvent::AiSpeechAudioChunk { job_id, seq, .. } => order.push((*job_id, Some(*seq))),
                ServerEvent::AiSpeechAudioEnd { job_id } => order.push((*job_id, None)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        let expected: Vec<_> = [first.job_id, second.job_id]
            .into_iter()
            .flat_map(|id| [(id, Some(0)), (id, Some(1)), (id, Some(2)), (id, None)])
            .collect();
        assert_eq!(order, expected);
    }
}
