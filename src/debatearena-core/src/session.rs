//! Per-session actor.
//!
//! Every input to a session (clock ticks, client commands, finished
//! generations) is serialized through one task that owns the
//! `DebateOrchestrator`. The actor executes the orchestrator's effects:
//! broadcasts go to the transport, generations and persistence run on
//! spawned tasks, audio jobs go to the session's audio worker.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioJob, AudioPipeline, DeliveryMode, run_audio_worker};
use crate::config::Config;
use crate::error::DebateError;
use crate::events::SessionId;
use crate::generation::{GenerationContext, SpeechGenerator};
use crate::orchestrator::{DebateOrchestrator, Effect, OrchestratorSettings};
use crate::participant::{Participant, ParticipantId, Team};
use crate::persistence::{TranscriptRecord, TranscriptSink};
use crate::state::{Outcome, StateSnapshot, TranscriptEntry};
use crate::transport::Transport;

const INBOX_CAPACITY: usize = 64;

/// Collaborators shared by every session of a process.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub transport: Arc<dyn Transport>,
    pub generator: Arc<dyn SpeechGenerator>,
    /// `None` broadcasts AI speeches as text only.
    pub audio: Option<Arc<AudioPipeline>>,
    pub sink: Arc<dyn TranscriptSink>,
}

enum SessionCommand {
    Submit {
        participant_id: ParticipantId,
        text: String,
        phase: Option<String>,
        reply: oneshot::Sender<Result<(), DebateError>>,
    },
    RequestAi {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<(), DebateError>>,
    },
    End {
        outcome: Outcome,
    },
    Snapshot {
        reply: oneshot::Sender<SessionView>,
    },
}

struct GenerationDone {
    epoch: u64,
    participant_id: ParticipantId,
    result: Result<String, DebateError>,
}

/// Read-only view of a session for callers outside the actor.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub snapshot: StateSnapshot,
    pub transcript: Vec<TranscriptEntry>,
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl SessionHandle {
    /// Validate the roster, start the debate and spawn its actor.
    ///
    /// Connections that must see the first state update have to be
    /// subscribed to the session channel before this is called.
    pub fn spawn(
        session_id: impl Into<SessionId>,
        topic: impl Into<String>,
        participants: Vec<Participant>,
        ctx: SessionContext,
    ) -> Result<Self, DebateError> {
        let session_id = session_id.into();
        let config = ctx.config.clone();
        let audio_mode = ctx
            .audio
            .as_ref()
            .filter(|pipeline| pipeline.is_available())
            .map(|_| {
                if config.streaming.enabled {
                    DeliveryMode::Stream
                } else {
                    DeliveryMode::Buffer
                }
            });
        let settings = OrchestratorSettings {
            end_phase_on_submit: config.timing.end_phase_on_submit,
            audio: audio_mode,
            generation: config.generation.clone(),
            pro_voice: config.get_voice(Team::Pro).to_string(),
            con_voice: config.get_voice(Team::Con).to_string(),
        };

        let mut orchestrator = DebateOrchestrator::new(session_id.clone(), config.format()?, settings);
        let initial = orchestrator.start(participants, topic)?;

        let (commands, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (results_tx, results) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let period = config.timing.tick_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let audio_jobs = match ctx.audio.clone().filter(|_| audio_mode.is_some()) {
            Some(pipeline) => {
                tokio::spawn(run_audio_worker(
                    session_id.clone(),
                    pipeline,
                    audio_rx,
                    ctx.transport.clone(),
                    cancel.clone(),
                ));
                Some(audio_tx)
            }
            None => None,
        };

        let actor = SessionActor {
            session_id: session_id.clone(),
            orchestrator,
            ctx,
            inbox,
            results,
            results_tx,
            audio_jobs,
            ticker,
            cancel: cancel.clone(),
        };
        let actor_done = done.clone();
        tokio::spawn(async move {
            actor.run(initial).await;
            actor_done.cancel();
        });

        Ok(Self {
            session_id,
            commands,
            cancel,
            done,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn submit_speech(
        &self,
        participant_id: impl Into<ParticipantId>,
        text: impl Into<String>,
        phase: Option<String>,
    ) -> Result<(), DebateError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Submit {
            participant_id: participant_id.into(),
            text: text.into(),
            phase,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Ask for a speech from an AI participant holding the floor. A request
    /// already outstanding for the current phase is not repeated.
    pub async fn request_ai_response(&self, participant_id: impl Into<ParticipantId>) -> Result<(), DebateError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::RequestAi {
            participant_id: participant_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn end(&self, outcome: Outcome) -> Result<(), DebateError> {
        self.send(SessionCommand::End { outcome }).await
    }

    pub async fn view(&self) -> Result<SessionView, DebateError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot, DebateError> {
        Ok(self.view().await?.snapshot)
    }

    /// Stop the session without waiting for the clock; the debate is aborted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the actor has exited.
    pub async fn finished(&self) {
        self.done.cancelled().await;
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), DebateError> {
        self.commands.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> DebateError {
        DebateError::SessionClosed(self.session_id.clone())
    }
}

struct SessionActor {
    session_id: SessionId,
    orchestrator: DebateOrchestrator,
    ctx: SessionContext,
    inbox: mpsc::Receiver<SessionCommand>,
    results: mpsc::UnboundedReceiver<GenerationDone>,
    results_tx: mpsc::UnboundedSender<GenerationDone>,
    audio_jobs: Option<mpsc::UnboundedSender<AudioJob>>,
    ticker: Interval,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self, initial: Vec<Effect>) {
        self.execute(initial).await;

        while !self.orchestrator.is_finished() {
            // Ticks are polled before commands: when both are ready the clock wins.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let effects = self.orchestrator.end(Outcome::Aborted {
                        reason: "session cancelled".to_string(),
                    });
                    self.execute(effects).await;
                }
                _ = self.ticker.tick() => {
                    let effects = self.orchestrator.tick();
                    self.execute(effects).await;
                }
                Some(done) = self.results.recv() => {
                    let effects = self.orchestrator.apply_ai_response(done.epoch, &done.participant_id, done.result);
                    self.execute(effects).await;
                }
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        let effects = self.orchestrator.end(Outcome::Aborted {
                            reason: "all session handles dropped".to_string(),
                        });
                        self.execute(effects).await;
                    }
                },
            }
        }

        self.cancel.cancel();
        debug!(session_id = %self.session_id, "Session actor stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Submit {
                participant_id,
                text,
                phase,
                reply,
            } => {
                let result = self
                    .orchestrator
                    .submit_human_speech(&participant_id, &text, phase.as_deref());
                let reply_result = match result {
                    Ok(effects) => {
                        self.execute(effects).await;
                        Ok(())
                    }
                    Err(e) => {
                        info!(
                            session_id = %self.session_id,
                            phase = %self.orchestrator.phase_key(),
                            participant_id = %participant_id,
                            error = %e,
                            "Speech rejected"
                        );
                        Err(e)
                    }
                };
                let _ = reply.send(reply_result);
            }
            SessionCommand::RequestAi {
                participant_id,
                reply,
            } => {
                let result = match self.orchestrator.request_ai_response(&participant_id) {
                    Ok(effects) => {
                        self.execute(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::End { outcome } => {
                let effects = self.orchestrator.end(outcome);
                self.execute(effects).await;
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(SessionView {
                    snapshot: self.orchestrator.snapshot(),
                    transcript: self.orchestrator.transcript().to_vec(),
                });
            }
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(event) => {
                    let name = event.name();
                    if let Err(e) = self.ctx.transport.publish(&self.session_id, event).await {
                        warn!(session_id = %self.session_id, event = name, error = %e, "Broadcast failed");
                    }
                }
                Effect::RequestGeneration { epoch, context } => self.spawn_generation(epoch, context),
                Effect::Synthesize(job) => {
                    let Some(audio_jobs) = &self.audio_jobs else {
                        continue;
                    };
                    if audio_jobs.send(job).is_err() {
                        warn!(session_id = %self.session_id, "Audio worker gone, dropping job");
                    }
                }
                Effect::PhaseStarted => self.ticker.reset(),
                Effect::Persist { transcript, outcome } => {
                    let record = TranscriptRecord {
                        session_id: self.session_id.clone(),
                        topic: self.orchestrator.topic().to_string(),
                        format: self.orchestrator.format_name().to_string(),
                        participants: self.orchestrator.participants().to_vec(),
                        outcome,
                        transcript,
                        finished_at: Utc::now(),
                    };
                    let sink = self.ctx.sink.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sink.persist(&record).await {
                            error!(session_id = %record.session_id, error = %e, "Failed to persist transcript");
                        }
                    });
                }
                Effect::Finished(outcome) => {
                    info!(session_id = %self.session_id, outcome = ?outcome, "Session finished");
                    self.cancel.cancel();
                }
            }
        }
    }

    fn spawn_generation(&self, epoch: u64, context: GenerationContext) {
        let generator = self.ctx.generator.clone();
        let timeout = self.ctx.config.generation.timeout();
        let results = self.results_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let participant_id = context.participant.id.clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, generator.generate(&context)) => match result {
                    Ok(result) => result,
                    Err(_) => Err(DebateError::Generation {
                        speaker: context.participant.name.clone(),
                        reason: format!("timed out after {:?}", timeout),
                    }),
                },
            };
            let _ = results.send(GenerationDone {
                epoch,
                participant_id,
                result,
            });
        });
    }
}
