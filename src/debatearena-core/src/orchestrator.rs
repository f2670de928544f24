//! Debate orchestration logic.
//!
//! `DebateOrchestrator` is the phase/turn state machine of one session. It
//! never performs I/O: every operation mutates the state and returns the
//! `Effect`s the owning session actor must carry out (broadcasts,
//! generation requests, audio jobs, persistence).

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{AudioJob, DeliveryMode};
use crate::config::{GenerationConfig, SynthesisProvider};
use crate::debate_format::{self, DebateFormat, PhaseDefinition, PhaseSpeaker};
use crate::error::DebateError;
use crate::events::{ServerEvent, SessionId};
use crate::generation::GenerationContext;
use crate::participant::{Participant, ParticipantId, Team};
use crate::state::{DebatePhase, DebateState, Outcome, StateSnapshot, TranscriptEntry};

/// Generated speeches of at most this many bytes are replaced by the fallback line.
const SHORT_SPEECH_LEN: usize = 10;

/// Work the session actor performs on behalf of the orchestrator.
#[derive(Debug)]
pub enum Effect {
    Broadcast(ServerEvent),
    /// Ask the language model for a speech. The result must come back through
    /// `apply_ai_response` with the same epoch.
    RequestGeneration { epoch: u64, context: GenerationContext },
    Synthesize(AudioJob),
    /// A phase was entered; its clock counts a full interval from now.
    PhaseStarted,
    Persist {
        transcript: Vec<TranscriptEntry>,
        outcome: Outcome,
    },
    /// The session reached a terminal phase; stop the timer and orphan jobs.
    Finished(Outcome),
}

/// Behavior switches for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub end_phase_on_submit: bool,
    /// Delivery mode for AI speech audio; `None` broadcasts text only.
    pub audio: Option<DeliveryMode>,
    pub generation: GenerationConfig,
    pub pro_voice: String,
    pub con_voice: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            end_phase_on_submit: true,
            audio: Some(DeliveryMode::Stream),
            generation: GenerationConfig::default(),
            pro_voice: SynthesisProvider::default().default_voice(Team::Pro).to_string(),
            con_voice: SynthesisProvider::default().default_voice(Team::Con).to_string(),
        }
    }
}

/// Orchestrates the debate between human and AI participants.
pub struct DebateOrchestrator {
    session_id: SessionId,
    format_name: String,
    phases: Vec<PhaseDefinition>,
    required_format: Box<dyn DebateFormat>,
    settings: OrchestratorSettings,
    topic: String,
    participants: Vec<Participant>,
    state: DebateState,
    /// Bumped on every phase change; generation results carry the epoch they were requested in.
    epoch: u64,
    /// AI participants whose speech for the current epoch is still outstanding.
    pending_ai: HashSet<ParticipantId>,
}

impl DebateOrchestrator {
    /// Create an orchestrator for a session that has not started yet.
    pub fn new(
        session_id: impl Into<SessionId>,
        format: Box<dyn DebateFormat>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            format_name: format.name().to_string(),
            phases: format.phases(),
            required_format: format,
            settings,
            topic: String::new(),
            participants: Vec::new(),
            state: DebateState::new(),
            epoch: 0,
            pending_ai: HashSet::new(),
        }
    }

    /// Validate the roster, enter the first phase and announce it.
    pub fn start(
        &mut self,
        participants: Vec<Participant>,
        topic: impl Into<String>,
    ) -> Result<Vec<Effect>, DebateError> {
        if self.state.phase != DebatePhase::NotStarted {
            return Err(DebateError::WrongPhase(format!(
                "session '{}' has already started",
                self.session_id
            )));
        }
        debate_format::validate_roster(self.required_format.as_ref(), &participants)?;

        self.participants = participants;
        self.topic = topic.into();

        info!(
            session_id = %self.session_id,
            format = %self.format_name,
            participants = self.participants.len(),
            "Debate starting"
        );

        let mut effects = Vec::new();
        self.enter_phase(0, &mut effects);
        Ok(effects)
    }

    /// Advance the clock by one interval.
    pub fn tick(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let DebatePhase::Running(index) = self.state.phase else {
            return effects;
        };

        self.state.remaining_time = self.state.remaining_time.saturating_sub(1);
        if self.state.remaining_time == 0 {
            debug!(session_id = %self.session_id, phase = %self.phase_key(), "Phase time expired");
            self.leave_phase(&mut effects);
            self.advance_from(index, &mut effects);
        } else {
            effects.push(self.state_update());
        }
        effects
    }

    /// Accept a speech from a human participant holding the floor.
    pub fn submit_human_speech(
        &mut self,
        participant_id: &str,
        text: &str,
        claimed_phase: Option<&str>,
    ) -> Result<Vec<Effect>, DebateError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DebateError::InvalidEvent("speech text cannot be empty".to_string()));
        }
        let DebatePhase::Running(index) = self.state.phase else {
            return Err(DebateError::WrongPhase(format!(
                "no speech is accepted while the debate is {}",
                self.phase_key()
            )));
        };
        let phase = &self.phases[index];

        if let Some(claimed) = claimed_phase {
            if claimed != phase.key {
                return Err(DebateError::WrongPhase(format!(
                    "speech was for '{}' but the current phase is '{}'",
                    claimed, phase.key
                )));
            }
        }

        let participant = self
            .participant(participant_id)
            .filter(|p| phase.speaker.includes(p.team, p.slot))
            .ok_or_else(|| DebateError::NotYourTurn {
                participant_id: participant_id.to_string(),
            })?;
        if participant.is_ai {
            return Err(DebateError::WrongPhase(format!(
                "'{}' is an AI speaker; its speech comes from the language model",
                phase.name
            )));
        }

        let entry = TranscriptEntry {
            participant_id: participant.id.clone(),
            speaker_name: participant.name.clone(),
            phase: phase.key.clone(),
            text: text.to_string(),
            timestamp: Utc::now(),
            fallback: false,
        };
        let single_speaker = matches!(phase.speaker, PhaseSpeaker::Single { .. });

        let mut effects = Vec::new();
        self.append(entry, &mut effects);

        if self.settings.end_phase_on_submit && single_speaker {
            debug!(session_id = %self.session_id, phase = %self.phase_key(), "Speech submitted, ending phase early");
            self.leave_phase(&mut effects);
            self.advance_from(index, &mut effects);
        }
        Ok(effects)
    }

    /// Request a generated speech for an AI participant holding the floor.
    pub fn request_ai_response(&mut self, participant_id: &str) -> Result<Vec<Effect>, DebateError> {
        let DebatePhase::Running(index) = self.state.phase else {
            return Err(DebateError::WrongPhase(format!(
                "no speech is generated while the debate is {}",
                self.phase_key()
            )));
        };
        let participant = self
            .participant(participant_id)
            .filter(|p| p.is_ai && self.phases[index].speaker.includes(p.team, p.slot))
            .cloned()
            .ok_or_else(|| DebateError::NotYourTurn {
                participant_id: participant_id.to_string(),
            })?;

        if !self.pending_ai.insert(participant.id.clone()) {
            debug!(session_id = %self.session_id, participant_id, "Generation already outstanding");
            return Ok(Vec::new());
        }

        let opponents = self
            .participants
            .iter()
            .filter(|p| p.team == participant.team.opponent())
            .map(|p| p.name.clone())
            .collect();
        let context = GenerationContext {
            session_id: self.session_id.clone(),
            topic: self.topic.clone(),
            participant,
            opponents,
            phase: self.phases[index].clone(),
            transcript: self.state.transcript().to_vec(),
        };
        Ok(vec![Effect::RequestGeneration {
            epoch: self.epoch,
            context,
        }])
    }

    /// Apply a finished generation. Results for an earlier phase are discarded.
    pub fn apply_ai_response(
        &mut self,
        epoch: u64,
        participant_id: &str,
        result: Result<String, DebateError>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state.phase.is_terminal() || epoch != self.epoch {
            info!(
                session_id = %self.session_id,
                phase = %self.phase_key(),
                participant_id,
                requested_epoch = epoch,
                current_epoch = self.epoch,
                "Discarding stale AI response"
            );
            return effects;
        }
        if !self.pending_ai.remove(participant_id) {
            warn!(session_id = %self.session_id, participant_id, "AI response with no outstanding request");
            return effects;
        }
        let Some(participant) = self.participant(participant_id).cloned() else {
            return effects;
        };

        let (text, fallback) = match result.map(|raw| sanitize_response(&raw)) {
            Ok(text) if text.len() > SHORT_SPEECH_LEN => (text, false),
            Ok(text) => {
                warn!(
                    session_id = %self.session_id,
                    phase = %self.phase_key(),
                    speaker = %participant.name,
                    chars = text.len(),
                    "Generated speech too short, using fallback line"
                );
                (self.settings.generation.fallback_for(&participant.name), true)
            }
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    phase = %self.phase_key(),
                    speaker = %participant.name,
                    error = %e,
                    "Generation failed, using fallback line"
                );
                (self.settings.generation.fallback_for(&participant.name), true)
            }
        };

        self.record_ai_speech(&participant, text, fallback, &mut effects);
        effects
    }

    /// End the debate early or on completion.
    pub fn end(&mut self, outcome: Outcome) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state.phase.is_terminal() {
            return effects;
        }
        self.finish(outcome, &mut effects);
        effects
    }

    pub fn state(&self) -> &DebateState {
        &self.state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot(&self.phases)
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.state.transcript()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn format_name(&self) -> &str {
        &self.format_name
    }

    pub fn is_finished(&self) -> bool {
        self.state.phase.is_terminal()
    }

    pub fn phase_key(&self) -> &str {
        self.state.phase.key(&self.phases)
    }

    fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    fn state_update(&self) -> Effect {
        Effect::Broadcast(ServerEvent::DebateStateUpdate(self.snapshot()))
    }

    fn append(&mut self, entry: TranscriptEntry, effects: &mut Vec<Effect>) {
        effects.push(Effect::Broadcast(ServerEvent::TranscriptEntry(entry.clone())));
        self.state.append(entry);
    }

    fn enter_phase(&mut self, index: usize, effects: &mut Vec<Effect>) {
        let phase = self.phases[index].clone();
        self.epoch += 1;
        self.pending_ai.clear();
        self.state.phase = DebatePhase::Running(index);
        self.state.remaining_time = phase.duration_secs;
        self.state.current_speaker_id = match &phase.speaker {
            PhaseSpeaker::Single { team, slot } => self
                .participants
                .iter()
                .find(|p| p.team == *team && p.slot == *slot)
                .map(|p| p.id.clone()),
            PhaseSpeaker::Crossfire { .. } => None,
        };

        info!(
            session_id = %self.session_id,
            phase = %phase.key,
            duration_secs = phase.duration_secs,
            speaker = ?self.state.current_speaker_id,
            "Entering phase"
        );
        effects.push(Effect::PhaseStarted);
        effects.push(self.state_update());

        let ai_speakers: Vec<ParticipantId> = self
            .participants
            .iter()
            .filter(|p| p.is_ai && phase.speaker.includes(p.team, p.slot))
            .map(|p| p.id.clone())
            .collect();
        for id in ai_speakers {
            match self.request_ai_response(&id) {
                Ok(mut more) => effects.append(&mut more),
                Err(e) => warn!(session_id = %self.session_id, error = %e, "Could not request AI speech"),
            }
        }
    }

    /// Close out the running phase: AI speakers that never answered get their fallback line.
    fn leave_phase(&mut self, effects: &mut Vec<Effect>) {
        let mut silent: Vec<ParticipantId> = self.pending_ai.drain().collect();
        silent.sort();
        for id in silent {
            let Some(participant) = self.participant(&id).cloned() else {
                continue;
            };
            warn!(
                session_id = %self.session_id,
                phase = %self.phase_key(),
                speaker = %participant.name,
                "Phase ended before the AI speech arrived, using fallback line"
            );
            let text = self.settings.generation.fallback_for(&participant.name);
            self.record_ai_speech(&participant, text, true, effects);
        }
    }

    fn advance_from(&mut self, index: usize, effects: &mut Vec<Effect>) {
        let next = index + 1;
        if next < self.phases.len() {
            self.enter_phase(next, effects);
        } else {
            self.finish(Outcome::Completed, effects);
        }
    }

    fn record_ai_speech(
        &mut self,
        participant: &Participant,
        text: String,
        fallback: bool,
        effects: &mut Vec<Effect>,
    ) {
        let entry = TranscriptEntry {
            participant_id: participant.id.clone(),
            speaker_name: participant.name.clone(),
            phase: self.phase_key().to_string(),
            text: text.clone(),
            timestamp: Utc::now(),
            fallback,
        };
        self.append(entry, effects);
        effects.push(Effect::Broadcast(ServerEvent::AiSpeech {
            speaker_name: participant.name.clone(),
            text: text.clone(),
        }));

        if let Some(mode) = self.settings.audio {
            effects.push(Effect::Synthesize(AudioJob {
                job_id: Uuid::new_v4(),
                participant_id: participant.id.clone(),
                speaker_name: participant.name.clone(),
                voice_id: self.voice_for(participant),
                text,
                mode,
            }));
        }
    }

    fn voice_for(&self, participant: &Participant) -> String {
        participant.voice_id.clone().unwrap_or_else(|| match participant.team {
            Team::Pro => self.settings.pro_voice.clone(),
            Team::Con => self.settings.con_voice.clone(),
        })
    }

    fn finish(&mut self, outcome: Outcome, effects: &mut Vec<Effect>) {
        self.epoch += 1;
        self.pending_ai.clear();
        self.state.phase = match outcome {
            Outcome::Completed => DebatePhase::Completed,
            Outcome::Aborted { .. } => DebatePhase::Aborted,
        };
        self.state.current_speaker_id = None;
        self.state.remaining_time = 0;

        info!(
            session_id = %self.session_id,
            outcome = ?outcome,
            entries = self.state.transcript().len(),
            "Debate finished"
        );

        effects.push(self.state_update());
        effects.push(Effect::Broadcast(ServerEvent::DebateEnded {
            outcome: outcome.clone(),
            transcript: self.state.transcript().to_vec(),
        }));
        effects.push(Effect::Persist {
            transcript: self.state.transcript().to_vec(),
            outcome: outcome.clone(),
        });
        effects.push(Effect::Finished(outcome));
    }
}

/// Sanitize AI response by stripping reasoning tokens and XML-like tags.
///
/// Removes patterns like <thinking>...</thinking>, <reflection>...</reflection>, etc.
pub fn sanitize_response(response: &str) -> String {
    // List of known reasoning/internal tags to strip with their content
    let tags_to_strip = [
        "thinking",
        "think",
        "reflection",
        "reflect",
        "internal",
        "reasoning",
        "thought",
        "scratch",
        "scratchpad",
        "plan",
        "analysis",
        "analyze",
        "consider",
        "pondering",
        "deliberation",
    ];

    let mut result = response.to_string();

    for tag in &tags_to_strip {
        let pattern = format!(r"(?is)<{tag}[^>]*>.*?</{tag}>", tag = tag);
        if let Ok(re) = regex::Regex::new(&pattern) {
            result = re.replace_all(&result, "").to_string();
        }
    }

    if let Ok(orphan_re) = regex::Regex::new(r"</?[\w]+[^>]*>") {
        result = orphan_re.replace_all(&result, "").to_string();
    }

    result = result.replace("*", "");

    if let Ok(ws_re) = regex::Regex::new(r"\s+") {
        result = ws_re.replace_all(&result, " ").to_string();
    }

    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate_format::PublicForumFormat;
    use crate::participant::SpeakerSlot;

    fn roster() -> Vec<Participant> {
        vec![
            Participant::human("p1", "Ada", Team::Pro, SpeakerSlot::First),
            Participant::ai("p2", "Pro Bot", Team::Pro, SpeakerSlot::Second),
            Participant::human("c1", "Grace", Team::Con, SpeakerSlot::First),
            Participant::ai("c2", "Con Bot", Team::Con, SpeakerSlot::Second),
        ]
    }

    fn orchestrator(end_phase_on_submit: bool) -> DebateOrchestrator {
        let settings = OrchestratorSettings {
            end_phase_on_submit,
            ..OrchestratorSettings::default()
        };
        DebateOrchestrator::new("s1", Box::new(PublicForumFormat::default()), settings)
    }

    fn started(end_phase_on_submit: bool) -> DebateOrchestrator {
        let mut orch = orchestrator(end_phase_on_submit);
        orch.start(roster(), "X").unwrap();
        orch
    }

    fn state_updates(effects: &[Effect]) -> Vec<StateSnapshot> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Broadcast(ServerEvent::DebateStateUpdate(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn generation_requests(effects: &[Effect]) -> Vec<(u64, ParticipantId)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::RequestGeneration { epoch, context } => {
                    Some((*epoch, context.participant.id.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Tick until the session leaves the current phase.
    fn run_out_phase(orch: &mut DebateOrchestrator) -> Vec<Effect> {
        let start = orch.phase_key().to_string();
        let mut effects = Vec::new();
        while orch.phase_key() == start {
            effects.extend(orch.tick());
        }
        effects
    }

    #[test]
    fn test_start_broadcasts_first_phase() {
        let mut orch = orchestrator(true);
        let effects = orch.start(roster(), "X").unwrap();
        let updates = state_updates(&effects);
        assert_eq!(
            updates[0],
            StateSnapshot {
                phase: "pro_constructive".to_string(),
                current_speaker_id: Some("p1".to_string()),
                remaining_time: 240,
            }
        );
        assert!(generation_requests(&effects).is_empty());
    }

    #[test]
    fn test_start_rejects_invalid_roster() {
        let mut orch = orchestrator(true);
        let mut participants = roster();
        participants.pop();
        assert!(matches!(
            orch.start(participants, "X"),
            Err(DebateError::InvalidRoster(_))
        ));
        assert_eq!(orch.phase_key(), "not_started");
    }

    #[test]
    fn test_start_twice_is_wrong_phase() {
        let mut orch = started(true);
        assert!(matches!(
            orch.start(roster(), "X"),
            Err(DebateError::WrongPhase(_))
        ));
    }

    #[test]
    fn test_remaining_time_non_increasing_and_resets_on_transition() {
        let mut orch = started(false);
        let durations: Vec<u32> = orch.phases().iter().map(|p| p.duration_secs).collect();
        let mut last = orch.snapshot();
        let mut index = 0;
        while !orch.is_finished() {
            for update in state_updates(&orch.tick()) {
                if update.phase == last.phase {
                    assert!(update.remaining_time < last.remaining_time);
                } else if update.phase != "completed" {
                    index += 1;
                    assert_eq!(update.remaining_time, durations[index]);
                }
                last = update;
            }
        }
        assert_eq!(index, durations.len() - 1);
        assert_eq!(orch.phase_key(), "completed");
    }

    #[test]
    fn test_con_phase_requests_ai_generation() {
        let mut orch = started(false);
        run_out_phase(&mut orch);
        assert_eq!(orch.phase_key(), "con_constructive");
        run_out_phase(&mut orch);
        // first crossfire: first speakers are both human
        let effects = run_out_phase(&mut orch);
        assert_eq!(orch.phase_key(), "pro_rebuttal");
        assert_eq!(generation_requests(&effects).len(), 1);
        assert_eq!(generation_requests(&effects)[0].1, "p2");
    }

    #[test]
    fn test_submit_from_non_speaker_is_rejected_without_mutation() {
        let mut orch = started(true);
        let before = orch.snapshot();
        let err = orch.submit_human_speech("c1", "I object to all of this.", None).unwrap_err();
        assert!(matches!(err, DebateError::NotYourTurn { .. }));
        assert!(orch.transcript().is_empty());
        assert_eq!(orch.snapshot(), before);
    }

    #[test]
    fn test_submit_accepts_current_speaker_and_ends_phase() {
        let mut orch = started(true);
        let effects = orch
            .submit_human_speech("p1", "Resolved: X is good.", Some("pro_constructive"))
            .unwrap();
        assert_eq!(orch.transcript().len(), 1);
        assert_eq!(orch.transcript()[0].phase, "pro_constructive");
        assert_eq!(orch.phase_key(), "con_constructive");
        assert_eq!(state_updates(&effects).last().unwrap().current_speaker_id.as_deref(), Some("c1"));
        assert!(effects.iter().any(|e| matches!(e, Effect::PhaseStarted)));
    }

    #[test]
    fn test_blank_submission_is_rejected_without_mutation() {
        let mut orch = started(true);
        let before = orch.snapshot();
        let err = orch.submit_human_speech("p1", "  \n\t ", None).unwrap_err();
        assert!(matches!(err, DebateError::InvalidEvent(_)));
        assert!(orch.transcript().is_empty());
        assert_eq!(orch.snapshot(), before);

        orch.submit_human_speech("p1", "  Resolved: X is good.  ", None).unwrap();
        assert_eq!(orch.transcript()[0].text, "Resolved: X is good.");
    }

    #[test]
    fn test_short_generated_speech_uses_fallback() {
        let mut orch = started(false);
        for _ in 0..3 {
            run_out_phase(&mut orch);
        }
        let epoch = orch.epoch;
        orch.apply_ai_response(epoch, "p2", Ok("<think>long</think>Ten chars!".to_string()));
        assert!(orch.transcript()[0].fallback);
    }

    #[test]
    fn test_submit_keeps_phase_when_early_end_disabled() {
        let mut orch = started(false);
        orch.submit_human_speech("p1", "First point.", None).unwrap();
        orch.submit_human_speech("p1", "Second point.", None).unwrap();
        assert_eq!(orch.transcript().len(), 2);
        assert_eq!(orch.phase_key(), "pro_constructive");
    }

    #[test]
    fn test_submit_with_stale_phase_claim_is_rejected() {
        let mut orch = started(true);
        orch.submit_human_speech("p1", "Resolved: X is good.", None).unwrap();
        let err = orch
            .submit_human_speech("c1", "Late reply.", Some("pro_constructive"))
            .unwrap_err();
        assert!(matches!(err, DebateError::WrongPhase(_)));
        assert_eq!(orch.transcript().len(), 1);
    }

    #[test]
    fn test_crossfire_accepts_both_first_speakers() {
        let mut orch = started(false);
        run_out_phase(&mut orch);
        run_out_phase(&mut orch);
        assert_eq!(orch.phase_key(), "first_crossfire");
        assert_eq!(orch.snapshot().current_speaker_id, None);
        orch.submit_human_speech("p1", "Question?", None).unwrap();
        orch.submit_human_speech("c1", "Answer.", None).unwrap();
        assert!(orch.submit_human_speech("p2", "Me too.", None).is_err());
        assert_eq!(orch.transcript().len(), 2);
        assert_eq!(orch.phase_key(), "first_crossfire");
    }

    #[test]
    fn test_ai_response_appends_and_enqueues_audio() {
        let mut orch = started(false);
        for _ in 0..3 {
            run_out_phase(&mut orch);
        }
        let epoch = orch.epoch;
        let effects = orch.apply_ai_response(
            epoch,
            "p2",
            Ok("<thinking>plan</thinking>My opponents ignore the evidence.".to_string()),
        );
        assert_eq!(orch.transcript().len(), 1);
        assert_eq!(orch.transcript()[0].text, "My opponents ignore the evidence.");
        assert!(!orch.transcript()[0].fallback);
        let job = effects.iter().find_map(|e| match e {
            Effect::Synthesize(job) => Some(job),
            _ => None,
        });
        assert_eq!(job.unwrap().voice_id, "21m00Tcm4TlvDq8ikWAM");
        assert!(effects.iter().any(|e| matches!(e, Effect::Broadcast(ServerEvent::AiSpeech { .. }))));
    }

    #[test]
    fn test_failed_generation_appends_fallback_and_phase_advances() {
        let mut orch = started(false);
        for _ in 0..3 {
            run_out_phase(&mut orch);
        }
        let epoch = orch.epoch;
        orch.apply_ai_response(
            epoch,
            "p2",
            Err(DebateError::Generation {
                speaker: "Pro Bot".to_string(),
                reason: "timeout".to_string(),
            }),
        );
        assert_eq!(orch.transcript().len(), 1);
        assert!(orch.transcript()[0].fallback);
        assert!(orch.transcript()[0].text.starts_with("Pro Bot yields"));
        run_out_phase(&mut orch);
        assert_eq!(orch.phase_key(), "con_rebuttal");
        assert_eq!(orch.transcript().len(), 1);
    }

    #[test]
    fn test_stale_ai_response_is_discarded() {
        let mut orch = started(false);
        for _ in 0..3 {
            run_out_phase(&mut orch);
        }
        let epoch = orch.epoch;
        // Phase expires with the speech outstanding: a fallback entry is recorded.
        run_out_phase(&mut orch);
        assert_eq!(orch.transcript().len(), 1);
        assert!(orch.transcript()[0].fallback);

        let effects = orch.apply_ai_response(epoch, "p2", Ok("A very late speech arrives.".to_string()));
        assert!(effects.is_empty());
        assert_eq!(orch.transcript().len(), 1);
    }

    #[test]
    fn test_duplicate_ai_response_is_ignored() {
        let mut orch = started(false);
        for _ in 0..3 {
            run_out_phase(&mut orch);
        }
        let epoch = orch.epoch;
        orch.apply_ai_response(epoch, "p2", Ok("The first and only speech.".to_string()));
        let effects = orch.apply_ai_response(epoch, "p2", Ok("A duplicate speech.".to_string()));
        assert!(effects.is_empty());
        assert_eq!(orch.transcript().len(), 1);
    }

    #[test]
    fn test_transcript_is_append_only() {
        let mut orch = started(true);
        orch.submit_human_speech("p1", "Opening for PRO.", None).unwrap();
        let snapshot = orch.transcript().to_vec();
        orch.submit_human_speech("c1", "Opening for CON.", None).unwrap();
        assert_eq!(&orch.transcript()[..snapshot.len()], snapshot.as_slice());
        assert_eq!(orch.transcript().len(), 2);
    }

    #[test]
    fn test_end_is_terminal_and_idempotent() {
        let mut orch = started(true);
        let effects = orch.end(Outcome::Aborted {
            reason: "host left".to_string(),
        });
        assert!(effects.iter().any(|e| matches!(e, Effect::Persist { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::Finished(Outcome::Aborted { .. }))));
        assert_eq!(orch.phase_key(), "aborted");
        assert!(orch.end(Outcome::Completed).is_empty());
        assert!(orch.tick().is_empty());
        assert!(matches!(
            orch.submit_human_speech("p1", "Too late.", None),
            Err(DebateError::WrongPhase(_))
        ));
    }

    #[test]
    fn test_request_ai_response_for_human_is_rejected() {
        let mut orch = started(true);
        assert!(matches!(
            orch.request_ai_response("p1"),
            Err(DebateError::NotYourTurn { .. })
        ));
    }

    #[test]
    fn test_sanitize_response_thinking_tags() {
        let input = "<thinking>Let me think about this...</thinking>The answer is 42.";
        assert_eq!(sanitize_response(input), "The answer is 42.");
    }

    #[test]
    fn test_sanitize_response_multiline_tags() {
        let input = "<thinking>\nMultiple\nlines\nof\nthought\n</thinking>Final answer here.";
        assert_eq!(sanitize_response(input), "Final answer here.");
    }

    #[test]
    fn test_sanitize_response_nested_content() {
        let input = "Start <think>nested <inner>tags</inner> content</think> end";
        let output = sanitize_response(input);
        assert!(!output.contains("<"));
        assert!(!output.contains(">"));
    }

    #[test]
    fn test_sanitize_response_multiple_tag_types() {
        let input = "<plan>First plan</plan>Then <reasoning>reason</reasoning> finally the answer.";
        assert_eq!(sanitize_response(input), "Then finally the answer.");
    }
}
