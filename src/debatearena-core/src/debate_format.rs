//! Debate format definitions and trait.
//!
//! A format is a fixed, linear table of timed phases plus the speaking
//! slots each team must fill. Formats are data: the built-in table can be
//! replaced through the `[[formats]]` section of the config file.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::FormatConfig;
use crate::error::DebateError;
use crate::participant::{Participant, SpeakerSlot, Team};

/// Who holds the floor during a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseSpeaker {
    /// One participant speaks, identified by team and slot.
    Single { team: Team, slot: SpeakerSlot },
    /// Cross-examination: the speakers in these slots on both teams share the floor.
    Crossfire { slots: Vec<SpeakerSlot> },
}

impl PhaseSpeaker {
    /// Whether a participant holding `team`/`slot` may speak in this phase.
    pub fn includes(&self, team: Team, slot: SpeakerSlot) -> bool {
        match self {
            PhaseSpeaker::Single { team: t, slot: s } => *t == team && *s == slot,
            PhaseSpeaker::Crossfire { slots } => slots.contains(&slot),
        }
    }
}

/// A timed phase within a debate (e.g., constructive speech, crossfire).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Wire name of this phase, e.g. `pro_constructive`.
    pub key: String,
    /// Name announced to participants.
    pub name: String,
    /// Instructions for this phase.
    pub description: String,
    /// Fixed length of the phase in seconds.
    pub duration_secs: u32,
    pub speaker: PhaseSpeaker,
    /// Maximum response length hint for AI speakers in this phase.
    pub max_tokens: u32,
}

/// Trait for defining debate formats.
///
/// Implement this trait to create custom debate formats like
/// parliamentary debates, Oxford-style debates, etc.
pub trait DebateFormat: Send + Sync {
    /// Returns the name of this debate format.
    fn name(&self) -> &str;

    /// Returns the display name for the format.
    fn display_name(&self) -> &str;

    /// Returns all phases of the debate in order.
    fn phases(&self) -> Vec<PhaseDefinition>;

    /// Slots each team must fill, exactly once each.
    fn required_slots(&self) -> Vec<SpeakerSlot>;

    /// Total number of participants a valid roster holds.
    fn participant_count(&self) -> usize {
        self.required_slots().len() * 2
    }
}

/// Scale a phase duration, keeping at least one second.
fn scaled_duration(duration_secs: u32, time_scale: f32) -> u32 {
    ((duration_secs as f32 * time_scale).round() as u32).max(1)
}

fn valid_scale(time_scale: f32) -> f32 {
    if time_scale > 0.0 { time_scale } else { 1.0 }
}

/// Public Forum format: two teams of two, three crossfires, final focus.
#[derive(Debug, Clone)]
pub struct PublicForumFormat {
    /// Multiplier applied to every phase duration (1.0 = tournament timing).
    time_scale: f32,
}

impl PublicForumFormat {
    pub fn new(time_scale: f32) -> Self {
        Self {
            time_scale: valid_scale(time_scale),
        }
    }

    fn phase(
        &self,
        key: &str,
        name: &str,
        description: &str,
        duration_secs: u32,
        speaker: PhaseSpeaker,
        max_tokens: u32,
    ) -> PhaseDefinition {
        PhaseDefinition {
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            duration_secs: scaled_duration(duration_secs, self.time_scale),
            speaker,
            max_tokens,
        }
    }
}

impl Default for PublicForumFormat {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl DebateFormat for PublicForumFormat {
    fn name(&self) -> &str {
        "public_forum"
    }

    fn display_name(&self) -> &str {
        "Public Forum Debate"
    }

    fn phases(&self) -> Vec<PhaseDefinition> {
        use SpeakerSlot::{First, Second};
        let single = |team, slot| PhaseSpeaker::Single { team, slot };

        vec![
            self.phase(
                "pro_constructive",
                "Pro Constructive",
                "The first PRO speaker presents the case in favor of the resolution.",
                240,
                single(Team::Pro, First),
                450,
            ),
            self.phase(
                "con_constructive",
                "Con Constructive",
                "The first CON speaker presents the case against the resolution.",
                240,
                single(Team::Con, First),
                450,
            ),
            self.phase(
                "first_crossfire",
                "First Crossfire",
                "The first speakers question each other directly.",
                180,
                PhaseSpeaker::Crossfire { slots: vec![First] },
                200,
            ),
            self.phase(
                "pro_rebuttal",
                "Pro Rebuttal",
                "The second PRO speaker attacks the CON case.",
                240,
                single(Team::Pro, Second),
                400,
            ),
            self.phase(
                "con_rebuttal",
                "Con Rebuttal",
                "The second CON speaker attacks the PRO case.",
                240,
                single(Team::Con, Second),
                400,
            ),
            self.phase(
                "second_crossfire",
                "Second Crossfire",
                "The second speakers question each other directly.",
                180,
                PhaseSpeaker::Crossfire { slots: vec![Second] },
                200,
            ),
            self.phase(
                "pro_summary",
                "Pro Summary",
                "The first PRO speaker summarizes the most important clashes.",
                180,
                single(Team::Pro, First),
                350,
            ),
            self.phase(
                "con_summary",
                "Con Summary",
                "The first CON speaker summarizes the most important clashes.",
                180,
                single(Team::Con, First),
                350,
            ),
            self.phase(
                "grand_crossfire",
                "Grand Crossfire",
                "All four speakers question each other.",
                180,
                PhaseSpeaker::Crossfire {
                    slots: vec![First, Second],
                },
                200,
            ),
            self.phase(
                "pro_final_focus",
                "Pro Final Focus",
                "The second PRO speaker explains why PRO wins the round.",
                120,
                single(Team::Pro, Second),
                250,
            ),
            self.phase(
                "con_final_focus",
                "Con Final Focus",
                "The second CON speaker explains why CON wins the round.",
                120,
                single(Team::Con, Second),
                250,
            ),
        ]
    }

    fn required_slots(&self) -> Vec<SpeakerSlot> {
        vec![SpeakerSlot::First, SpeakerSlot::Second]
    }
}

/// A format loaded from the `[[formats]]` config table.
#[derive(Debug, Clone)]
pub struct ConfiguredFormat {
    config: FormatConfig,
    time_scale: f32,
}

impl ConfiguredFormat {
    pub fn new(config: FormatConfig, time_scale: f32) -> Result<Self, DebateError> {
        if config.phases.is_empty() {
            return Err(DebateError::ConfigError(format!(
                "format '{}' defines no phases",
                config.name
            )));
        }
        let mut keys = HashSet::new();
        for phase in &config.phases {
            if phase.duration_secs == 0 {
                return Err(DebateError::ConfigError(format!(
                    "phase '{}' of format '{}' has zero duration",
                    phase.key, config.name
                )));
            }
            if matches!(phase.key.as_str(), "not_started" | "completed" | "aborted") {
                return Err(DebateError::ConfigError(format!(
                    "phase key '{}' is reserved",
                    phase.key
                )));
            }
            if !keys.insert(phase.key.as_str()) {
                return Err(DebateError::ConfigError(format!(
                    "duplicate phase key '{}' in format '{}'",
                    phase.key, config.name
                )));
            }
            let slot_ok = match &phase.speaker {
                PhaseSpeaker::Single { slot, .. } => config.slots.contains(slot),
                PhaseSpeaker::Crossfire { slots } => {
                    !slots.is_empty() && slots.iter().all(|s| config.slots.contains(s))
                }
            };
            if !slot_ok {
                return Err(DebateError::ConfigError(format!(
                    "phase '{}' names a slot the format does not declare",
                    phase.key
                )));
            }
        }
        Ok(Self {
            config,
            time_scale: valid_scale(time_scale),
        })
    }
}

impl DebateFormat for ConfiguredFormat {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    fn phases(&self) -> Vec<PhaseDefinition> {
        self.config
            .phases
            .iter()
            .map(|p| PhaseDefinition {
                key: p.key.clone(),
                name: p.name.clone(),
                description: p.description.clone(),
                duration_secs: scaled_duration(p.duration_secs, self.time_scale),
                speaker: p.speaker.clone(),
                max_tokens: p.max_tokens,
            })
            .collect()
    }

    fn required_slots(&self) -> Vec<SpeakerSlot> {
        self.config.slots.clone()
    }
}

/// Check that a roster fills every required slot on both teams exactly once.
pub fn validate_roster(
    format: &dyn DebateFormat,
    participants: &[Participant],
) -> Result<(), DebateError> {
    let expected = format.participant_count();
    if participants.len() != expected {
        return Err(DebateError::InvalidRoster(format!(
            "format '{}' needs {} participants, got {}",
            format.name(),
            expected,
            participants.len()
        )));
    }

    let mut ids = HashSet::new();
    for p in participants {
        if p.id.trim().is_empty() {
            return Err(DebateError::InvalidRoster(
                "participant id cannot be empty".to_string(),
            ));
        }
        if !ids.insert(p.id.as_str()) {
            return Err(DebateError::InvalidRoster(format!(
                "duplicate participant id '{}'",
                p.id
            )));
        }
    }

    let required = format.required_slots();
    let mut filled = HashSet::new();
    for p in participants {
        if !required.contains(&p.slot) {
            return Err(DebateError::InvalidRoster(format!(
                "{} holds a {} slot that format '{}' does not use",
                p.name,
                p.slot,
                format.name()
            )));
        }
        if !filled.insert((p.team, p.slot)) {
            return Err(DebateError::InvalidRoster(format!(
                "duplicate {} on team {}",
                p.slot, p.team
            )));
        }
    }

    for team in [Team::Pro, Team::Con] {
        for slot in &required {
            if !filled.contains(&(team, *slot)) {
                return Err(DebateError::InvalidRoster(format!(
                    "team {} is missing its {}",
                    team, slot
                )));
            }
        }
    }

    Ok(())
}

/// Get a built-in debate format by name.
pub fn get_format(name: &str, time_scale: f32) -> Option<Box<dyn DebateFormat>> {
    match name.to_lowercase().as_str() {
        "public_forum" | "pf" => Some(Box::new(PublicForumFormat::new(time_scale))),
        _ => None,
    }
}

/// List all built-in debate format names.
pub fn available_formats() -> Vec<&'static str> {
    vec!["public_forum"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseConfig;

    fn roster() -> Vec<Participant> {
        vec![
            Participant::human("p1", "Ada", Team::Pro, SpeakerSlot::First),
            Participant::ai("p2", "Pro Bot", Team::Pro, SpeakerSlot::Second),
            Participant::human("c1", "Grace", Team::Con, SpeakerSlot::First),
            Participant::ai("c2", "Con Bot", Team::Con, SpeakerSlot::Second),
        ]
    }

    #[test]
    fn test_public_forum_phase_order() {
        let phases = PublicForumFormat::default().phases();
        assert_eq!(phases.len(), 11);
        assert_eq!(phases[0].key, "pro_constructive");
        assert_eq!(phases[2].key, "first_crossfire");
        assert_eq!(phases[10].key, "con_final_focus");
        assert_eq!(
            phases[0].speaker,
            PhaseSpeaker::Single {
                team: Team::Pro,
                slot: SpeakerSlot::First
            }
        );
    }

    #[test]
    fn test_time_scale_never_reaches_zero() {
        let phases = PublicForumFormat::new(0.001).phases();
        assert!(phases.iter().all(|p| p.duration_secs == 1));
        let phases = PublicForumFormat::new(0.5).phases();
        assert_eq!(phases[0].duration_secs, 120);
    }

    #[test]
    fn test_validate_roster_accepts_full_roster() {
        let format = PublicForumFormat::default();
        assert!(validate_roster(&format, &roster()).is_ok());
    }

    #[test]
    fn test_validate_roster_rejects_duplicate_slot() {
        let format = PublicForumFormat::default();
        let mut participants = roster();
        participants[1].slot = SpeakerSlot::First;
        let err = validate_roster(&format, &participants).unwrap_err();
        assert!(matches!(err, DebateError::InvalidRoster(_)));
    }

    #[test]
    fn test_validate_roster_rejects_missing_team() {
        let format = PublicForumFormat::default();
        let mut participants = roster();
        participants[2].team = Team::Pro;
        participants[3].team = Team::Pro;
        assert!(validate_roster(&format, &participants).is_err());
    }

    #[test]
    fn test_validate_roster_rejects_wrong_count_and_duplicate_id() {
        let format = PublicForumFormat::default();
        assert!(validate_roster(&format, &roster()[..3]).is_err());

        let mut participants = roster();
        participants[3].id = "p1".to_string();
        let err = validate_roster(&format, &participants).unwrap_err();
        assert!(err.to_string().contains("duplicate participant id"));
    }

    #[test]
    fn test_crossfire_includes_both_teams() {
        let speaker = PhaseSpeaker::Crossfire {
            slots: vec![SpeakerSlot::First],
        };
        assert!(speaker.includes(Team::Pro, SpeakerSlot::First));
        assert!(speaker.includes(Team::Con, SpeakerSlot::First));
        assert!(!speaker.includes(Team::Con, SpeakerSlot::Second));
    }

    fn mini_format(key: &str, duration_secs: u32) -> FormatConfig {
        FormatConfig {
            name: "mini".to_string(),
            display_name: "Mini".to_string(),
            slots: vec![SpeakerSlot::First],
            phases: vec![PhaseConfig {
                key: key.to_string(),
                name: "Opening".to_string(),
                description: String::new(),
                duration_secs,
                speaker: PhaseSpeaker::Single {
                    team: Team::Pro,
                    slot: SpeakerSlot::First,
                },
                max_tokens: 100,
            }],
        }
    }

    #[test]
    fn test_configured_format_rejects_reserved_key() {
        assert!(ConfiguredFormat::new(mini_format("completed", 10), 1.0).is_err());
    }

    #[test]
    fn test_configured_format_applies_time_scale() {
        let format = ConfiguredFormat::new(mini_format("opening", 60), 0.25).unwrap();
        assert_eq!(format.phases()[0].duration_secs, 15);
        let format = ConfiguredFormat::new(mini_format("opening", 60), 0.001).unwrap();
        assert_eq!(format.phases()[0].duration_secs, 1);
    }

    #[test]
    fn test_get_format() {
        assert_eq!(get_format("public_forum", 1.0).unwrap().name(), "public_forum");
        assert!(get_format("unknown_format", 1.0).is_none());
    }
}
