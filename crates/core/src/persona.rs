//! Persona configuration and the system-instruction strategy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_VOICE: &str = "Zephyr";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRating {
    #[default]
    Standard,
    Mature,
}

impl FromStr for ContentRating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "mature" => Ok(Self::Mature),
            other => Err(format!("'{other}' is not a content rating (standard|mature)")),
        }
    }
}

impl fmt::Display for ContentRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Mature => write!(f, "mature"),
        }
    }
}

/// Who the model is for the length of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub display_name: String,
    pub voice_name: String,
    pub instructions: String,
    #[serde(default)]
    pub content_rating: ContentRating,
    #[serde(default)]
    pub language_hint: Option<String>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            display_name: "Aria".to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            instructions: "You are a warm, curious companion who enjoys a relaxed conversation."
                .to_string(),
            content_rating: ContentRating::Standard,
            language_hint: None,
        }
    }
}

/// Turns a persona into the system instruction sent in the handshake.
#[cfg_attr(test, mockall::automock)]
pub trait PromptBuilder: Send + Sync {
    fn system_instruction(&self, persona: &PersonaConfig) -> String;
}

const VOICE_GUIDANCE: &str = "You are speaking out loud in a live voice conversation. \
Keep answers short and conversational. Never use markdown, lists or emoji. \
If the user interrupts you, stop and listen.";

fn base_instruction(persona: &PersonaConfig) -> String {
    let mut text = format!(
        "Your name is {}.\n\n{}\n\n{}",
        persona.display_name,
        persona.instructions.trim(),
        VOICE_GUIDANCE
    );
    if let Some(language) = &persona.language_hint {
        text.push_str(&format!("\nSpeak in the language identified by '{language}' unless asked otherwise."));
    }
    text
}

pub struct StandardPrompt;

impl PromptBuilder for StandardPrompt {
    fn system_instruction(&self, persona: &PersonaConfig) -> String {
        format!(
            "{}\nKeep every topic suitable for a general audience.",
            base_instruction(persona)
        )
    }
}

pub struct MaturePrompt;

impl PromptBuilder for MaturePrompt {
    fn system_instruction(&self, persona: &PersonaConfig) -> String {
        format!(
            "{}\nThe user is a verified adult. Mature themes and strong language are allowed when \
             the conversation calls for them.",
            base_instruction(persona)
        )
    }
}

pub fn builder_for(rating: ContentRating) -> Arc<dyn PromptBuilder> {
    match rating {
        ContentRating::Standard => Arc::new(StandardPrompt),
        ContentRating::Mature => Arc::new(MaturePrompt),
    }
}
