//! Prompt composition
//!
//! Builds the single system message for a turn out of the session's
//! instruction layers, in fixed order: persona identity first, then the
//! optional framework and linguistic-control blocks. Turn-specific
//! augmentation (the current-time marker and grounding text) is applied by
//! the dispatch router, not here, so the composed text stays reusable
//! across turns.

use chrono::{DateTime, Local};

use crate::core::config::{Framework, LinguisticControl, Persona};

/// Compose the system prompt for a turn.
///
/// Absent optional layers are skipped entirely; no empty headers and no
/// doubled blank separators are emitted.
pub fn compose(
    persona: &Persona,
    framework: Option<&Framework>,
    linguistic: Option<&LinguisticControl>,
) -> String {
    let mut blocks: Vec<String> = Vec::with_capacity(3);

    blocks.push(format!(
        "You are acting as {}: {}",
        persona.name,
        persona.system_prompt.trim()
    ));

    if let Some(framework) = framework {
        let content = framework.content.trim();
        if !content.is_empty() {
            blocks.push(format!("Apply the {} framework:\n{}", framework.name, content));
        }
    }

    if let Some(linguistic) = linguistic {
        let instruction = linguistic.system_instruction.trim();
        if !instruction.is_empty() {
            blocks.push(format!(
                "Follow the {} style:\n{}",
                linguistic.name, instruction
            ));
        }
    }

    blocks.join("\n\n")
}

/// Current-time marker the router prefixes onto the system message so the
/// model can anchor relative dates.
pub fn time_marker(now: DateTime<Local>) -> String {
    format!("Current date and time: {}.", now.format("%A, %B %-d, %Y, %H:%M"))
}

/// Apply the turn-specific augmentations to a composed system prompt: the
/// time marker always, grounding text only when the search produced any.
pub fn augment_system_prompt(
    system: &str,
    now: DateTime<Local>,
    grounding: Option<&str>,
) -> String {
    let mut augmented = time_marker(now);
    let trimmed = system.trim();
    if !trimmed.is_empty() {
        augmented.push_str("\n\n");
        augmented.push_str(trimmed);
    }
    if let Some(grounding) = grounding {
        let grounding = grounding.trim();
        if !grounding.is_empty() {
            augmented.push_str("\n\nRelevant web results:\n");
            augmented.push_str(grounding);
        }
    }
    augmented
}
