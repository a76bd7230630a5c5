use gemini_realtime::client::DEFAULT_MODEL;
use livetalk_core::ContentRating;
use livetalk_core::persona::DEFAULT_VOICE;
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub api_key: SecretString,
    pub model: String,
    pub voice_name: String,
    pub language_hint: Option<String>,
    pub persona_name: String,
    pub persona_prompt_path: Option<PathBuf>,
    pub content_rating: ContentRating,
    pub log_level: Level,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = optional_var("GEMINI_API_KEY")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let model = optional_var("LIVE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if !model.starts_with("models/") {
            return Err(ConfigError::InvalidValue(
                "LIVE_MODEL".to_string(),
                format!("'{model}' must start with 'models/'"),
            ));
        }

        let voice_name = optional_var("VOICE_NAME").unwrap_or_else(|| DEFAULT_VOICE.to_string());
        let language_hint = optional_var("LANGUAGE_HINT");
        let persona_name = optional_var("PERSONA_NAME").unwrap_or_else(|| "Aria".to_string());
        let persona_prompt_path = optional_var("PERSONA_PROMPT_PATH").map(PathBuf::from);

        let content_rating = match optional_var("CONTENT_RATING") {
            Some(value) => value
                .parse::<ContentRating>()
                .map_err(|e| ConfigError::InvalidValue("CONTENT_RATING".to_string(), e))?,
            None => ContentRating::Standard,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_key,
            model,
            voice_name,
            language_hint,
            persona_name,
            persona_prompt_path,
            content_rating,
            log_level,
        })
    }
}
