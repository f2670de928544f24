//! Terminal rendering for `simulate`: an all-AI debate watched through an
//! ordinary transport connection.

use std::collections::HashMap;

use colored::Colorize;
use debatearena_core::events::JobId;
use debatearena_core::{
    ClientEvent, Config, DebateError, Outcome, Participant, PhaseDefinition, ServerEvent,
    SessionContext, SessionRegistry, StartDebate, Team, TranscriptEntry,
};
use uuid::Uuid;

const WIDTH: usize = 70;

/// Reject a model list that cannot be spread over the format's roster.
pub fn check_roster_size(config: &Config, models: usize) -> Result<(), DebateError> {
    let needed = config.format()?.participant_count();
    if models > 1 && models != needed {
        return Err(DebateError::InvalidRoster(format!(
            "the '{}' format needs {} models (or one shared model), but {} were provided",
            config.timing.format, needed, models
        )));
    }
    Ok(())
}

/// Seat one AI per slot, alternating teams in speaking order.
fn build_roster(config: &Config, models: &[String], names: &[String]) -> Result<Vec<Participant>, DebateError> {
    let slots = config.format()?.required_slots();
    let mut participants = Vec::with_capacity(slots.len() * 2);
    for slot in slots {
        for team in [Team::Pro, Team::Con] {
            let i = participants.len();
            let name = names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("{} {}", team.display_name(), slot));
            let mut participant = Participant::ai(format!("ai-{}", i + 1), name, team, slot);
            if let Some(model) = models.get(i).or_else(|| models.first()) {
                participant = participant.with_model(model.clone());
            }
            participants.push(participant);
        }
    }
    Ok(participants)
}

/// Run the debate to completion, printing every event. Ctrl-c aborts it.
pub async fn simulate(
    ctx: SessionContext,
    topic: String,
    models: Vec<String>,
    names: Vec<String>,
) -> Result<(), DebateError> {
    let format = ctx.config.format()?;
    let phases: HashMap<String, PhaseDefinition> = format
        .phases()
        .into_iter()
        .map(|phase| (phase.key.clone(), phase))
        .collect();
    let participants = build_roster(&ctx.config, &models, &names)?;

    print_header(&ctx, format.display_name(), &topic, &participants);

    let transport = ctx.transport.clone();
    let registry = SessionRegistry::new(ctx);
    let connection = Uuid::new_v4();
    let mut subscription = transport.connect(connection).await;

    let session_id = format!("console-{}", Uuid::new_v4());
    registry
        .route(
            connection,
            ClientEvent::StartDebate(StartDebate {
                session_id: session_id.clone(),
                topic,
                participants,
            }),
        )
        .await?;

    let mut view = ConsoleView::new(phases);
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if view.render(&event) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("{}", "Interrupted, ending debate...".yellow());
                if let Some(handle) = registry.get(&session_id) {
                    handle
                        .end(Outcome::Aborted { reason: "interrupted".to_string() })
                        .await?;
                }
            }
        }
    }

    registry.disconnect(connection).await;
    registry.shutdown().await;
    Ok(())
}

fn print_header(ctx: &SessionContext, display_name: &str, topic: &str, participants: &[Participant]) {
    println!();
    println!("{}", "═".repeat(WIDTH).bright_blue());
    println!(
        "{}",
        format!("  {} - {}", "DebateArena".bold(), display_name)
            .bright_blue()
            .bold()
    );
    println!("{}", "═".repeat(WIDTH).bright_blue());
    println!();
    println!("{} {}", "Topic:".bold(), topic.bright_white());
    println!();
    println!("{}", "Participants:".bold());
    for (i, p) in participants.iter().enumerate() {
        let model = p
            .model
            .as_deref()
            .unwrap_or(ctx.config.generation.model.as_str());
        println!(
            "  {}. {} ({}) - using {}",
            i + 1,
            p.name.bright_cyan(),
            p.team.display_name().yellow(),
            model.dimmed()
        );
    }
    if ctx.audio.is_some() {
        println!(
            "{} PRO {} / CON {}",
            "Voices:".bold(),
            ctx.config.get_voice(Team::Pro).dimmed(),
            ctx.config.get_voice(Team::Con).dimmed()
        );
    }
    println!();
    println!("{}", "─".repeat(WIDTH).dimmed());
}

/// Tracks what has been shown so far.
struct ConsoleView {
    phases: HashMap<String, PhaseDefinition>,
    current_phase: Option<String>,
    audio: HashMap<JobId, (u32, usize)>,
}

impl ConsoleView {
    fn new(phases: HashMap<String, PhaseDefinition>) -> Self {
        Self {
            phases,
            current_phase: None,
            audio: HashMap::new(),
        }
    }

    /// Print one event; returns true once the debate has ended.
    fn render(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::DebateStateUpdate(snapshot) => {
                if self.current_phase.as_deref() != Some(snapshot.phase.as_str()) {
                    self.current_phase = Some(snapshot.phase.clone());
                    self.phase_banner(&snapshot.phase, snapshot.remaining_time);
                }
            }
            ServerEvent::TranscriptEntry(entry) => print_entry(entry),
            ServerEvent::AiSpeech { .. } => {}
            ServerEvent::AiSpeechAudioChunk { job_id, audio, .. } => {
                let (chunks, bytes) = self.audio.entry(*job_id).or_default();
                *chunks += 1;
                *bytes += audio.len();
            }
            ServerEvent::AiSpeechAudio { job_id, audio } => {
                let (chunks, bytes) = self.audio.entry(*job_id).or_default();
                *chunks += 1;
                *bytes += audio.len();
            }
            ServerEvent::AiSpeechAudioEnd { job_id } => {
                if let Some((chunks, bytes)) = self.audio.remove(job_id) {
                    println!(
                        "  {}",
                        format!("♪ audio: {} chunk(s), {} bytes", chunks, bytes).dimmed()
                    );
                }
            }
            ServerEvent::DebateError { message, error } => {
                println!("{} {} ({})", "Error:".red().bold(), message, error.dimmed());
            }
            ServerEvent::DebateEnded { outcome, transcript } => {
                println!();
                println!("{}", "═".repeat(WIDTH).bright_blue());
                match outcome {
                    Outcome::Completed => println!(
                        "{}",
                        format!("  Debate concluded. {} speeches.", transcript.len())
                            .bright_green()
                            .bold()
                    ),
                    Outcome::Aborted { reason } => println!(
                        "{}",
                        format!("  Debate aborted: {}", reason).yellow().bold()
                    ),
                }
                println!("{}", "═".repeat(WIDTH).bright_blue());
                println!();
                return true;
            }
        }
        false
    }

    fn phase_banner(&self, key: &str, remaining: u32) {
        let (name, description) = match self.phases.get(key) {
            Some(phase) => (phase.name.as_str(), phase.description.as_str()),
            None => (key, ""),
        };
        println!();
        println!("{}", "═".repeat(WIDTH).bright_magenta());
        println!(
            "{}",
            format!("  📢 ANNOUNCER: {} ({}s)", name, remaining)
                .bright_magenta()
                .bold()
        );
        if !description.is_empty() {
            println!("  {}", description.dimmed());
        }
        println!("{}", "═".repeat(WIDTH).bright_magenta());
        println!();
    }
}

fn print_entry(entry: &TranscriptEntry) {
    let marker = if entry.fallback { " (no response)" } else { "" };
    println!(
        "{} {}{}",
        "▶".bright_cyan(),
        entry.speaker_name.bright_cyan().bold(),
        marker.yellow()
    );
    // Word wrap and indent the content
    for line in textwrap(&entry.text, WIDTH - 4).lines() {
        println!("  {}", line);
    }
    println!();
}

/// Simple text wrapping function.
fn textwrap(text: &str, width: usize) -> String {
    let mut result = String::new();
    let mut current_line_len = 0;

    for word in text.split_whitespace() {
        if current_line_len + word.len() + 1 > width && current_line_len > 0 {
            result.push('\n');
            current_line_len = 0;
        }
        if current_line_len > 0 {
            result.push(' ');
            current_line_len += 1;
        }
        result.push_str(word);
        current_line_len += word.len();
    }

    result
}
