//! Terminal host for a live voice session.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging.
//! 3. Building the persona, the Gemini connector and the audio backend.
//! 4. Spawning the session controller and echoing its observables.
//! 5. Turning console lines into session commands until `/quit` or Ctrl+C.

mod commands;
mod config;
#[cfg(feature = "devices")]
mod devices;
#[cfg_attr(feature = "devices", allow(dead_code))]
mod silent;

use anyhow::Context;
use clap::Parser;
use commands::{HELP, HostCommand};
use config::Config;
use gemini_realtime::{GeminiConfig, GeminiConnector};
use livetalk_core::persona::{self, PersonaConfig};
use livetalk_core::tools::ToolCallDispatcher;
use livetalk_core::transcript::Speaker;
use livetalk_core::{
    AudioBackend, ContentRating, SessionConfig, SessionController, SessionObservers,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Talk to a Gemini Live voice persona from the terminal")]
struct Cli {
    /// Prebuilt voice to speak with (overrides VOICE_NAME).
    #[arg(long)]
    voice: Option<String>,

    /// Name the persona introduces itself with (overrides PERSONA_NAME).
    #[arg(long)]
    persona_name: Option<String>,

    /// BCP-47 language code for speech (overrides LANGUAGE_HINT).
    #[arg(long)]
    language: Option<String>,

    /// Allow mature content (overrides CONTENT_RATING).
    #[arg(long)]
    mature: bool,

    /// Start a session immediately.
    #[arg(long)]
    start: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(voice) = self.voice {
            config.voice_name = voice;
        }
        if let Some(name) = self.persona_name {
            config.persona_name = name;
        }
        if let Some(language) = self.language {
            config.language_hint = Some(language);
        }
        if self.mature {
            config.content_rating = ContentRating::Mature;
        }
    }
}

fn build_persona(config: &Config) -> anyhow::Result<PersonaConfig> {
    let defaults = PersonaConfig::default();
    let instructions = match &config.persona_prompt_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read persona prompt {}", path.display()))?,
        None => defaults.instructions,
    };
    Ok(PersonaConfig {
        display_name: config.persona_name.clone(),
        voice_name: config.voice_name.clone(),
        instructions,
        content_rating: config.content_rating,
        language_hint: config.language_hint.clone(),
    })
}

#[cfg(feature = "devices")]
fn audio_backend() -> Arc<dyn AudioBackend> {
    Arc::new(devices::CpalBackend)
}

#[cfg(not(feature = "devices"))]
fn audio_backend() -> Arc<dyn AudioBackend> {
    warn!("Built without the `devices` feature; microphone and speaker are silent.");
    Arc::new(silent::SilentBackend)
}

/// Prints observable changes until the controller goes away.
fn spawn_printers(observers: &SessionObservers, persona_name: String) {
    let mut status = observers.status.clone();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("* {current}");
        }
    });

    let mut transcript = observers.transcript.clone();
    tokio::spawn(async move {
        let mut printed = HashSet::new();
        while transcript.changed().await.is_ok() {
            let entries = transcript.borrow_and_update().clone();
            if entries.is_empty() {
                printed.clear();
            }
            for entry in entries.iter().filter(|e| e.is_final) {
                if printed.insert(entry.id) {
                    let who = match entry.speaker {
                        Speaker::User => "you",
                        Speaker::Model => persona_name.as_str(),
                    };
                    println!("[{who}] {}", entry.text.trim());
                }
            }
        }
    });

    let mut tool_status = observers.tool_status.clone();
    tokio::spawn(async move {
        while tool_status.changed().await.is_ok() {
            if let Some(text) = tool_status.borrow_and_update().clone() {
                println!("~ {text}");
            }
        }
    });

    let mut error = observers.error.clone();
    tokio::spawn(async move {
        while error.changed().await.is_ok() {
            if let Some(message) = error.borrow_and_update().clone() {
                eprintln!("! {message}");
            }
        }
    });

    let mut muted = observers.muted.clone();
    tokio::spawn(async move {
        while muted.changed().await.is_ok() {
            let on = *muted.borrow_and_update();
            println!("* microphone {}", if on { "muted" } else { "live" });
        }
    });

    let mut input_level = observers.input_level.clone();
    let mut output_level = observers.output_level.clone();
    tokio::spawn(async move {
        let mut shown = (0u8, 0u8);
        loop {
            tokio::select! {
                changed = input_level.changed() => if changed.is_err() { break },
                changed = output_level.changed() => if changed.is_err() { break },
            }
            let levels = (
                (*input_level.borrow_and_update() * 10.0) as u8,
                (*output_level.borrow_and_update() * 10.0) as u8,
            );
            if levels != shown {
                shown = levels;
                tracing::debug!(mic = levels.0, speaker = levels.1, "Levels");
            }
        }
    });
}

/// Applies one console command. Returns `false` when the host should exit.
async fn dispatch(controller: &SessionController, command: HostCommand) -> anyhow::Result<bool> {
    match command {
        HostCommand::Start => controller.start().await?,
        HostCommand::Stop => controller.stop().await?,
        HostCommand::Mute(muted) => controller.set_muted(muted).await?,
        HostCommand::Voice(voice) => controller.set_voice(voice).await?,
        HostCommand::TextMode(enabled) => controller.set_text_input_mode(enabled).await?,
        HostCommand::Say(text) => {
            if controller.status().is_active() {
                controller.send_text(text).await?;
            } else {
                println!("(no session; type /start first)");
            }
        }
        HostCommand::Help => println!("{HELP}"),
        HostCommand::Nothing => {}
        HostCommand::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let cli = Cli::parse();
    let auto_start = cli.start;
    let mut config = Config::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!(
            "{},tungstenite=warn,tokio_tungstenite=warn",
            config.log_level
        )))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Initializing session...");

    // --- 3. Build the session ---
    let persona = build_persona(&config)?;
    let prompt = persona::builder_for(persona.content_rating);
    info!(
        model = %config.model,
        voice = %persona.voice_name,
        persona = %persona.display_name,
        rating = %persona.content_rating,
        "Session configured."
    );

    let connector = GeminiConnector::new(GeminiConfig::new(config.api_key).with_model(config.model));

    let persona_name = persona.display_name.clone();
    let (controller, controller_task) = SessionController::spawn(SessionConfig {
        persona,
        connector: Arc::new(connector),
        backend: audio_backend(),
        prompt,
        tools: ToolCallDispatcher::with_builtins(),
    });
    spawn_printers(controller.observers(), persona_name);

    // --- 4. Console loop ---
    println!("{HELP}");
    if auto_start {
        controller.start().await?;
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                match HostCommand::parse(&line) {
                    Ok(command) => {
                        if !dispatch(&controller, command).await? {
                            break;
                        }
                    }
                    Err(message) => println!("{message}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            }
        }
    }

    controller.shutdown().await?;
    controller_task.await.context("Session controller panicked")?;
    info!("Session controller has shut down.");
    Ok(())
}
