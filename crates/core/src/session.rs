//! The session controller: one actor task that owns a live voice session.
//!
//! [`SessionController::spawn`] starts the actor and returns a cloneable
//! command handle. All mutable session state (devices, connection, transcript,
//! status) lives inside the actor and is changed only by its `select!` loop,
//! which processes commands, connection resolutions, inbound events and
//! playback completions one at a time. Observers read state through `watch`
//! channels; every status transition is also broadcast in order.

use crate::capture::{CaptureDevice, CaptureError, CaptureLine};
use crate::codec::{self, PLAYBACK_SAMPLE_RATE};
use crate::error::EngineError;
use crate::events::{ClientEvent, ServerEvent, SessionSetup};
use crate::meter::Meter;
use crate::persona::{PersonaConfig, PromptBuilder};
use crate::playback::{AudioOutput, PlaybackError, PlaybackScheduler, VoiceId};
use crate::tools::ToolCallDispatcher;
use crate::transcript::{Speaker, TranscriptionAggregator, TranscriptionEntry};
use crate::transport::{Connector, LiveLink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

const COMMAND_CAPACITY: usize = 32;
const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Initializing,
    Listening,
    Thinking,
    Speaking,
    Error,
}

impl SessionStatus {
    /// Whether a session is running or being set up.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Listening | Self::Thinking | Self::Speaking
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Hands out fresh audio devices for each session.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    /// Opens the output device along with the channel on which it reports
    /// voices that finished playing.
    fn open_output(
        &self,
    ) -> Result<(Box<dyn AudioOutput>, mpsc::UnboundedReceiver<VoiceId>), PlaybackError>;
}

/// Everything the controller is built from.
pub struct SessionConfig {
    pub persona: PersonaConfig,
    pub connector: Arc<dyn Connector>,
    pub backend: Arc<dyn AudioBackend>,
    pub prompt: Arc<dyn PromptBuilder>,
    pub tools: ToolCallDispatcher,
}

/// Read-only views of the session state.
#[derive(Clone)]
pub struct SessionObservers {
    pub status: watch::Receiver<SessionStatus>,
    pub transcript: watch::Receiver<Vec<TranscriptionEntry>>,
    pub input_level: watch::Receiver<f32>,
    pub output_level: watch::Receiver<f32>,
    pub tool_status: watch::Receiver<Option<String>>,
    pub error: watch::Receiver<Option<String>>,
    pub muted: watch::Receiver<bool>,
    pub text_input_mode: watch::Receiver<bool>,
    transitions: broadcast::Sender<SessionStatus>,
}

impl SessionObservers {
    /// Every status change from now on, in order.
    pub fn transitions(&self) -> broadcast::Receiver<SessionStatus> {
        self.transitions.subscribe()
    }
}

struct Publishers {
    status: watch::Sender<SessionStatus>,
    transcript: watch::Sender<Vec<TranscriptionEntry>>,
    input_level: Arc<watch::Sender<f32>>,
    output_level: Arc<watch::Sender<f32>>,
    tool_status: watch::Sender<Option<String>>,
    error: watch::Sender<Option<String>>,
    muted: watch::Sender<bool>,
    text_input_mode: watch::Sender<bool>,
    transitions: broadcast::Sender<SessionStatus>,
}

fn channels() -> (Publishers, SessionObservers) {
    let (status, status_rx) = watch::channel(SessionStatus::Idle);
    let (transcript, transcript_rx) = watch::channel(Vec::new());
    let (input_level, input_level_rx) = watch::channel(0.0);
    let (output_level, output_level_rx) = watch::channel(0.0);
    let (tool_status, tool_status_rx) = watch::channel(None);
    let (error, error_rx) = watch::channel(None);
    let (muted, muted_rx) = watch::channel(false);
    let (text_input_mode, text_input_mode_rx) = watch::channel(false);
    let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);

    let observers = SessionObservers {
        status: status_rx,
        transcript: transcript_rx,
        input_level: input_level_rx,
        output_level: output_level_rx,
        tool_status: tool_status_rx,
        error: error_rx,
        muted: muted_rx,
        text_input_mode: text_input_mode_rx,
        transitions: transitions.clone(),
    };
    let publishers = Publishers {
        status,
        transcript,
        input_level: Arc::new(input_level),
        output_level: Arc::new(output_level),
        tool_status,
        error,
        muted,
        text_input_mode,
        transitions,
    };
    (publishers, observers)
}

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    SetMuted(bool),
    SendText(String),
    SetVoice(String),
    SetPersona(Box<PersonaConfig>),
    SetTextInputMode(bool),
    Shutdown,
}

/// Cloneable handle to a running session actor.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    observers: SessionObservers,
}

impl SessionController {
    /// Spawns the actor on the current runtime.
    pub fn spawn(config: SessionConfig) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (publishers, observers) = channels();
        let span = info_span!("live_session", persona = %config.persona.display_name);
        let engine = SessionEngine::new(config, commands_rx, publishers);
        let task = tokio::spawn(engine.run().instrument(span));
        (
            Self {
                commands: commands_tx,
                observers,
            },
            task,
        )
    }

    pub fn observers(&self) -> &SessionObservers {
        &self.observers
    }

    pub fn status(&self) -> SessionStatus {
        *self.observers.status.borrow()
    }

    pub fn transcript(&self) -> Vec<TranscriptionEntry> {
        self.observers.transcript.borrow().clone()
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.send(Command::Stop).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), EngineError> {
        self.send(Command::SetMuted(muted)).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::SendText(text.into())).await
    }

    pub async fn set_voice(&self, voice: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::SetVoice(voice.into())).await
    }

    pub async fn set_persona(&self, persona: PersonaConfig) -> Result<(), EngineError> {
        self.send(Command::SetPersona(Box::new(persona))).await
    }

    pub async fn set_text_input_mode(&self, enabled: bool) -> Result<(), EngineError> {
        self.send(Command::SetTextInputMode(enabled)).await
    }

    /// Stops any session and ends the actor.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::ControllerGone)
    }
}

enum LinkState {
    Connecting,
    Open(LiveLink),
    Failed,
}

/// Identifies one `start()` and the state of its connection.
struct SessionHandle {
    generation: u64,
    link: LinkState,
}

/// Resources that exist only between `start()` and teardown.
struct ActiveSession {
    handle: SessionHandle,
    capture: CaptureLine,
    input_meter: Meter,
    playback: PlaybackScheduler,
    ended: mpsc::UnboundedReceiver<VoiceId>,
}

impl ActiveSession {
    fn outbound(&self) -> Option<&mpsc::Sender<ClientEvent>> {
        match &self.handle.link {
            LinkState::Open(link) => Some(&link.outbound),
            _ => None,
        }
    }
}

type Resolution = (u64, Result<LiveLink, EngineError>);

struct SessionEngine {
    persona: PersonaConfig,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn AudioBackend>,
    prompt: Arc<dyn PromptBuilder>,
    tools: ToolCallDispatcher,

    commands: mpsc::Receiver<Command>,
    resolved_tx: mpsc::UnboundedSender<Resolution>,
    resolved_rx: mpsc::UnboundedReceiver<Resolution>,
    publish: Publishers,

    session: Option<ActiveSession>,
    generation: u64,
    transcript: TranscriptionAggregator,
    status: SessionStatus,
    muted: bool,
    pending_restart: bool,
}

enum SessionSignal {
    Event(ServerEvent),
    VoiceEnded(VoiceId),
}

/// Waits for the next inbound event or playback completion of the active
/// session. Never resolves while no session is open.
async fn next_signal(session: &mut Option<ActiveSession>) -> SessionSignal {
    let Some(ActiveSession { handle, ended, .. }) = session else {
        return std::future::pending().await;
    };

    let inbound = async {
        match &mut handle.link {
            LinkState::Open(link) => link
                .inbound
                .recv()
                .await
                .unwrap_or_else(|| ServerEvent::Closed(Some("connection dropped".to_string()))),
            _ => std::future::pending().await,
        }
    };
    let finished = async {
        match ended.recv().await {
            Some(voice) => voice,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        event = inbound => SessionSignal::Event(event),
        voice = finished => SessionSignal::VoiceEnded(voice),
    }
}

impl SessionEngine {
    fn new(config: SessionConfig, commands: mpsc::Receiver<Command>, publish: Publishers) -> Self {
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        Self {
            persona: config.persona,
            connector: config.connector,
            backend: config.backend,
            prompt: config.prompt,
            tools: config.tools,
            commands,
            resolved_tx,
            resolved_rx,
            publish,
            session: None,
            generation: 0,
            transcript: TranscriptionAggregator::new(),
            status: SessionStatus::Idle,
            muted: false,
            pending_restart: false,
        }
    }

    async fn run(mut self) {
        info!(voice = %self.persona.voice_name, "Session controller ready");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some((generation, result)) = self.resolved_rx.recv() => {
                    self.on_resolved(generation, result);
                }
                signal = next_signal(&mut self.session) => match signal {
                    SessionSignal::Event(event) => self.on_server_event(event),
                    SessionSignal::VoiceEnded(voice) => self.on_voice_ended(voice),
                },
            }
        }
        self.teardown();
        self.set_status(SessionStatus::Idle);
        info!("Session controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!(?command, "Handling command");
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::SetMuted(muted) => self.set_muted(muted),
            Command::SendText(text) => self.send_text(text),
            Command::SetVoice(voice) => self.set_voice(voice),
            Command::SetPersona(persona) => self.set_persona(*persona),
            Command::SetTextInputMode(enabled) => {
                self.publish.text_input_mode.send_replace(enabled);
            }
            Command::Shutdown => {}
        }
    }

    fn start(&mut self) {
        if self.status.is_active() {
            debug!(status = %self.status, "Session already active; ignoring start");
            return;
        }

        self.publish.error.send_replace(None);
        self.transcript.clear();
        self.publish_transcript();
        self.set_status(SessionStatus::Initializing);

        let device = match self.backend.open_capture() {
            Ok(device) => device,
            Err(e) => return self.fail(e.into()),
        };
        let mut capture = CaptureLine::new();
        capture.set_muted(self.muted);
        if let Err(e) = capture.start(device) {
            return self.fail(e.into());
        }

        let (output, ended) = match self.backend.open_output() {
            Ok(output) => output,
            Err(e) => return self.fail(e.into()),
        };
        let playback = PlaybackScheduler::new(output, self.publish.output_level.clone());

        self.generation += 1;
        let generation = self.generation;
        let setup = self.session_setup();
        let connector = self.connector.clone();
        let resolved = self.resolved_tx.clone();
        info!(generation, voice = %setup.voice_name, tools = setup.tools.len(), "Connecting");
        tokio::spawn(
            async move {
                let result = connector.connect(setup).await;
                // The receiver lives as long as the engine.
                let _ = resolved.send((generation, result));
            }
            .in_current_span(),
        );

        self.session = Some(ActiveSession {
            handle: SessionHandle {
                generation,
                link: LinkState::Connecting,
            },
            capture,
            input_meter: Meter::new(self.publish.input_level.clone()),
            playback,
            ended,
        });
    }

    fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            voice_name: self.persona.voice_name.clone(),
            system_instruction: self.prompt.system_instruction(&self.persona),
            language_hint: self.persona.language_hint.clone(),
            tools: self.tools.declarations(),
            transcribe_input: true,
            transcribe_output: true,
        }
    }

    fn on_resolved(&mut self, generation: u64, result: Result<LiveLink, EngineError>) {
        let current = self.session.as_mut().filter(|s| {
            s.handle.generation == generation && matches!(s.handle.link, LinkState::Connecting)
        });
        let Some(session) = current else {
            debug!(generation, "Discarding a stale connection attempt");
            if let Ok(link) = result {
                link.close();
            }
            return;
        };

        match result {
            Ok(link) => {
                session.capture.attach(link.outbound.clone());
                let level = session.capture.level();
                session.input_meter.start(move || level.get());
                session.handle.link = LinkState::Open(link);
                info!(generation, "Connection open");
                self.set_status(SessionStatus::Listening);
            }
            Err(e) => {
                session.handle.link = LinkState::Failed;
                self.fail(e);
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::InputTranscript(text) => {
                if self.transcript.push_fragment(Speaker::User, &text) {
                    self.publish_transcript();
                }
                if !self.model_audible() {
                    self.set_status(SessionStatus::Listening);
                }
            }
            ServerEvent::OutputTranscript(text) => {
                if self.transcript.push_fragment(Speaker::Model, &text) {
                    self.publish_transcript();
                }
                self.model_speaking();
            }
            ServerEvent::Audio(block) => {
                let rate = codec::rate_from_mime_type(&block.mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
                let buffer = match codec::decode(&block, rate, 1) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        warn!(error = %e, "Dropped malformed audio from the model");
                        return;
                    }
                };
                if let Some(session) = self.session.as_mut() {
                    session.playback.enqueue(buffer);
                }
                self.model_speaking();
            }
            ServerEvent::TurnComplete => {
                if self.transcript.finalize_turn() {
                    self.publish_transcript();
                }
                if !self.model_audible() {
                    self.set_status(SessionStatus::Thinking);
                }
            }
            ServerEvent::Interrupted => {
                debug!("Model was interrupted");
                if let Some(session) = self.session.as_mut() {
                    session.playback.interrupt();
                }
            }
            ServerEvent::ToolCall(requests) => {
                self.publish
                    .tool_status
                    .send_replace(Some(self.tools.status_text(&requests)));
                let responses: Vec<_> = requests.iter().map(|r| self.tools.dispatch(r)).collect();
                let Some(outbound) = self.session.as_ref().and_then(ActiveSession::outbound) else {
                    warn!("Tool call arrived without an open connection");
                    return;
                };
                if let Err(e) = outbound.try_send(ClientEvent::ToolResponse(responses)) {
                    warn!(error = %e, "Could not send tool responses");
                }
            }
            ServerEvent::ToolCallCancellation(ids) => {
                info!(?ids, "Tool calls cancelled");
                self.publish.tool_status.send_replace(None);
            }
            ServerEvent::GoAway(time_left) => {
                warn!(?time_left, "Server will close the connection soon");
            }
            ServerEvent::Error(message) => {
                self.fail(EngineError::Connection(message));
            }
            ServerEvent::Closed(reason) => {
                info!(?reason, "Connection closed");
                self.stop();
            }
        }
    }

    /// Speaking with audio still queued. Stopped voices report no completion
    /// and model transcripts can trail the audio, so `Speaking` alone does not
    /// mean the model is still heard.
    fn model_audible(&self) -> bool {
        self.status == SessionStatus::Speaking
            && self
                .session
                .as_ref()
                .is_some_and(|session| !session.playback.is_idle())
    }

    fn model_speaking(&mut self) {
        self.publish.tool_status.send_replace(None);
        self.set_status(SessionStatus::Speaking);
    }

    fn on_voice_ended(&mut self, voice: VoiceId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.playback.on_voice_ended(voice) && self.status == SessionStatus::Speaking {
            debug!("Playback drained");
            self.set_status(SessionStatus::Listening);
        }
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(session) = &self.session {
            session.capture.set_muted(muted);
        }
        self.publish.muted.send_replace(muted);
    }

    fn send_text(&mut self, text: String) {
        let Some(outbound) = self.session.as_ref().and_then(ActiveSession::outbound) else {
            debug!("No open connection; text not sent");
            return;
        };
        if let Err(e) = outbound.try_send(ClientEvent::Text(text)) {
            warn!(error = %e, "Could not send text");
        }
    }

    fn set_voice(&mut self, voice: String) {
        if voice == self.persona.voice_name {
            return;
        }
        info!(from = %self.persona.voice_name, to = %voice, "Voice changed");
        self.persona.voice_name = voice;
        self.restart_if_active();
    }

    fn set_persona(&mut self, persona: PersonaConfig) {
        if persona == self.persona {
            return;
        }
        info!(persona = %persona.display_name, "Persona changed");
        self.persona = persona;
        self.restart_if_active();
    }

    fn restart_if_active(&mut self) {
        if self.status.is_active() {
            self.pending_restart = true;
            self.stop();
        }
    }

    fn stop(&mut self) {
        self.teardown();
        self.set_status(SessionStatus::Idle);
        if std::mem::take(&mut self.pending_restart) {
            info!("Restarting with the new configuration");
            self.start();
        }
    }

    fn fail(&mut self, error: EngineError) {
        error!(error = %error, "Session failed");
        self.publish.error.send_replace(Some(error.to_string()));
        self.pending_restart = false;
        self.set_status(SessionStatus::Error);
        self.teardown();
    }

    /// Releases everything a session holds. Safe to call repeatedly.
    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let LinkState::Open(link) = session.handle.link {
                link.close();
            }
            session.capture.stop();
            session.input_meter.stop();
            session.playback.close();
            info!(generation = session.handle.generation, "Session torn down");
        }
        self.muted = false;
        self.publish.muted.send_replace(false);
        self.publish.text_input_mode.send_replace(false);
        self.publish.tool_status.send_replace(None);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        info!(from = %self.status, to = %status, "Status changed");
        self.status = status;
        self.publish.status.send_replace(status);
        // No subscribers is fine.
        let _ = self.publish.transitions.send(status);
    }

    fn publish_transcript(&self) {
        self.publish.transcript.send_replace(self.transcript.snapshot());
    }
}
