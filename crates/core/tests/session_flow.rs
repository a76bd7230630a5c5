use async_trait::async_trait;
use livetalk_core::capture::{CaptureDevice, CaptureError, FRAME_SIZE};
use livetalk_core::codec::{self, PlaybackBuffer};
use livetalk_core::persona::StandardPrompt;
use livetalk_core::playback::{AudioOutput, OutputClock, PlaybackError, VoiceId};
use livetalk_core::tools::{ToolCallDispatcher, ToolCallRequest};
use livetalk_core::transcript::Speaker;
use livetalk_core::{
    AudioBackend, ClientEvent, Connector, EngineError, LinkPeer, LiveLink, PersonaConfig,
    ServerEvent, SessionConfig, SessionController, SessionSetup, SessionStatus,
};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

struct FakeConnector {
    peers: mpsc::UnboundedSender<(SessionSetup, LinkPeer)>,
    fail_next: Mutex<Option<String>>,
    gate: Option<Arc<Notify>>,
    connects: AtomicUsize,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, setup: SessionSetup) -> Result<LiveLink, EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(EngineError::Connection(message));
        }
        let (link, peer) = LiveLink::pair(64);
        self.peers.send((setup, peer)).unwrap();
        Ok(link)
    }
}

struct FakeMic {
    chunks: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
}

impl CaptureDevice for FakeMic {
    fn open(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<f32>>, CaptureError> {
        self.chunks.take().ok_or(CaptureError::NoDevice)
    }

    fn close(&mut self) {}
}

struct FrozenClock;

impl OutputClock for FrozenClock {
    fn now(&self) -> f64 {
        0.0
    }
}

#[derive(Default)]
struct SpeakerLog {
    scheduled: Vec<(VoiceId, f64)>,
    stopped: Vec<VoiceId>,
}

struct FakeSpeaker {
    log: Arc<Mutex<SpeakerLog>>,
}

impl AudioOutput for FakeSpeaker {
    fn clock(&self) -> Arc<dyn OutputClock> {
        Arc::new(FrozenClock)
    }

    fn schedule(
        &mut self,
        voice: VoiceId,
        _buffer: Arc<PlaybackBuffer>,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        self.log.lock().unwrap().scheduled.push((voice, start_at));
        Ok(())
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        self.log.lock().unwrap().stopped.push(voice);
    }

    fn close(&mut self) {}
}

#[derive(Default)]
struct FakeBackend {
    deny_capture: AtomicBool,
    mic: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
    ended: Mutex<Option<mpsc::UnboundedSender<VoiceId>>>,
    log: Arc<Mutex<SpeakerLog>>,
}

impl FakeBackend {
    fn speak(&self, samples: Vec<f32>) {
        let mic = self.mic.lock().unwrap();
        mic.as_ref().expect("capture opened").send(samples).unwrap();
    }

    fn finish(&self, voice: VoiceId) {
        let ended = self.ended.lock().unwrap();
        ended.as_ref().expect("output opened").send(voice).unwrap();
    }
}

impl AudioBackend for FakeBackend {
    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("blocked by user".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.mic.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeMic { chunks: Some(rx) }))
    }

    fn open_output(
        &self,
    ) -> Result<(Box<dyn AudioOutput>, mpsc::UnboundedReceiver<VoiceId>), PlaybackError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.ended.lock().unwrap() = Some(tx);
        let speaker = FakeSpeaker {
            log: self.log.clone(),
        };
        Ok((Box::new(speaker), rx))
    }
}

struct Harness {
    controller: SessionController,
    connector: Arc<FakeConnector>,
    backend: Arc<FakeBackend>,
    peers: mpsc::UnboundedReceiver<(SessionSetup, LinkPeer)>,
}

impl Harness {
    fn new() -> Self {
        Self::build(None)
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self::build(Some(gate))
    }

    fn build(gate: Option<Arc<Notify>>) -> Self {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            peers: peers_tx,
            fail_next: Mutex::new(None),
            gate,
            connects: AtomicUsize::new(0),
        });
        let backend = Arc::new(FakeBackend::default());
        let (controller, _task) = SessionController::spawn(SessionConfig {
            persona: PersonaConfig::default(),
            connector: connector.clone(),
            backend: backend.clone(),
            prompt: Arc::new(StandardPrompt),
            tools: ToolCallDispatcher::with_builtins(),
        });
        Self {
            controller,
            connector,
            backend,
            peers,
        }
    }

    async fn wait_status(&self, status: SessionStatus) {
        let mut rx = self.controller.observers().status.clone();
        within(rx.wait_for(|s| *s == status)).await.unwrap();
    }

    async fn next_peer(&mut self) -> (SessionSetup, LinkPeer) {
        within(self.peers.recv()).await.expect("connector dropped")
    }

    /// Starts a session and returns the provider side of its connection.
    async fn open(&mut self) -> LinkPeer {
        self.controller.start().await.unwrap();
        let (_, peer) = self.next_peer().await;
        self.wait_status(SessionStatus::Listening).await;
        peer
    }
}

async fn next_outbound(peer: &mut LinkPeer, keep: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    loop {
        let event = within(peer.outbound.recv()).await.expect("link closed");
        if keep(&event) {
            return event;
        }
    }
}

fn model_audio(frames: usize) -> ServerEvent {
    ServerEvent::Audio(codec::encode(&vec![0.1; frames], 24_000))
}

#[tokio::test]
async fn test_start_opens_a_listening_session() {
    let mut h = Harness::new();
    let mut transitions = h.controller.observers().transitions();
    h.controller.start().await.unwrap();

    let (setup, _peer) = h.next_peer().await;
    assert_eq!(setup.voice_name, "Zephyr");
    assert!(setup.system_instruction.starts_with("Your name is Aria."));
    assert!(setup.transcribe_input && setup.transcribe_output);
    assert!(setup.tools.iter().any(|t| t.name == "roll_dice"));

    h.wait_status(SessionStatus::Listening).await;
    assert_eq!(within(transitions.recv()).await.unwrap(), SessionStatus::Initializing);
    assert_eq!(within(transitions.recv()).await.unwrap(), SessionStatus::Listening);
}

#[tokio::test]
async fn test_start_while_active_is_ignored() {
    let mut h = Harness::new();
    let _peer = h.open().await;
    h.controller.start().await.unwrap();
    h.controller.set_text_input_mode(true).await.unwrap();

    let mut mode = h.controller.observers().text_input_mode.clone();
    within(mode.wait_for(|on| *on)).await.unwrap();
    assert_eq!(h.controller.status(), SessionStatus::Listening);
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_voice_change_restarts_the_session() {
    let mut h = Harness::new();
    let mut first = h.open().await;
    let mut transitions = h.controller.observers().transitions();

    h.controller.set_voice("Puck").await.unwrap();
    let (setup, _second) = h.next_peer().await;
    assert_eq!(setup.voice_name, "Puck");

    let mut seen = Vec::new();
    while seen.last() != Some(&SessionStatus::Listening) {
        seen.push(within(transitions.recv()).await.unwrap());
    }
    assert_eq!(
        seen,
        vec![
            SessionStatus::Idle,
            SessionStatus::Initializing,
            SessionStatus::Listening
        ]
    );
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);

    let closing = next_outbound(&mut first, |e| !matches!(e, ClientEvent::Audio(_))).await;
    assert_eq!(closing, ClientEvent::AudioStreamEnd);
    assert_eq!(within(first.outbound.recv()).await, Some(ClientEvent::Close));
}

#[tokio::test]
async fn test_same_voice_or_idle_voice_change_does_not_connect() {
    let mut h = Harness::new();
    h.controller.set_voice("Kore").await.unwrap();
    h.controller.set_voice("Kore").await.unwrap();
    let (setup, _peer) = {
        h.controller.start().await.unwrap();
        h.next_peer().await
    };
    assert_eq!(setup.voice_name, "Kore");

    h.wait_status(SessionStatus::Listening).await;
    h.controller.set_voice("Kore").await.unwrap();
    h.controller.set_text_input_mode(true).await.unwrap();
    let mut mode = h.controller.observers().text_input_mode.clone();
    within(mode.wait_for(|on| *on)).await.unwrap();
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent_from_any_state() {
    let mut h = Harness::new();
    h.controller.stop().await.unwrap();
    h.wait_status(SessionStatus::Idle).await;

    let mut peer = h.open().await;
    h.controller.set_muted(true).await.unwrap();
    h.controller.stop().await.unwrap();
    h.controller.stop().await.unwrap();
    h.wait_status(SessionStatus::Idle).await;

    let closing = next_outbound(&mut peer, |e| !matches!(e, ClientEvent::Audio(_))).await;
    assert_eq!(closing, ClientEvent::AudioStreamEnd);

    let mut muted = h.controller.observers().muted.clone();
    within(muted.wait_for(|m| !*m)).await.unwrap();
}

#[tokio::test]
async fn test_connection_failure_is_retained_until_next_start() {
    let mut h = Harness::new();
    *h.connector.fail_next.lock().unwrap() = Some("handshake rejected".to_string());
    h.controller.start().await.unwrap();
    h.wait_status(SessionStatus::Error).await;

    let error = h.controller.observers().error.borrow().clone();
    assert!(error.unwrap().contains("handshake rejected"));

    // Settled: nothing moves the status until the next command.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.controller.status(), SessionStatus::Error);

    let _peer = h.open().await;
    assert!(h.controller.observers().error.borrow().is_none());
}

#[tokio::test]
async fn test_server_error_tears_the_session_down() {
    let mut h = Harness::new();
    let mut peer = h.open().await;
    peer.inbound
        .send(ServerEvent::Error("quota exceeded".to_string()))
        .await
        .unwrap();

    h.wait_status(SessionStatus::Error).await;
    let closing = next_outbound(&mut peer, |e| !matches!(e, ClientEvent::Audio(_))).await;
    assert_eq!(closing, ClientEvent::AudioStreamEnd);

    h.controller.stop().await.unwrap();
    h.wait_status(SessionStatus::Idle).await;
    assert!(h.controller.observers().error.borrow().is_some());
}

#[tokio::test]
async fn test_graceful_close_returns_to_idle() {
    let mut h = Harness::new();
    let peer = h.open().await;
    peer.inbound.send(ServerEvent::Closed(None)).await.unwrap();
    h.wait_status(SessionStatus::Idle).await;
    assert!(h.controller.observers().error.borrow().is_none());
}

#[tokio::test]
async fn test_capture_denied_fails_the_start() {
    let h = Harness::new();
    h.backend.deny_capture.store(true, Ordering::SeqCst);
    h.controller.start().await.unwrap();
    h.wait_status(SessionStatus::Error).await;

    let error = h.controller.observers().error.borrow().clone().unwrap();
    assert!(error.contains("blocked by user"));
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_late_connection_after_stop_is_closed() {
    let gate = Arc::new(Notify::new());
    let mut h = Harness::gated(gate.clone());
    h.controller.start().await.unwrap();
    h.wait_status(SessionStatus::Initializing).await;
    h.controller.stop().await.unwrap();
    h.wait_status(SessionStatus::Idle).await;

    gate.notify_one();
    let (_, mut peer) = h.next_peer().await;
    assert_eq!(
        within(peer.outbound.recv()).await,
        Some(ClientEvent::AudioStreamEnd)
    );
    assert_eq!(within(peer.outbound.recv()).await, Some(ClientEvent::Close));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.controller.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn test_tool_calls_are_answered_on_the_same_connection() {
    let mut h = Harness::new();
    let mut peer = h.open().await;
    peer.inbound
        .send(ServerEvent::ToolCall(vec![ToolCallRequest {
            id: "call-9".to_string(),
            name: "roll_dice".to_string(),
            args: json!({"sides": 6, "count": 2}),
        }]))
        .await
        .unwrap();

    let response = next_outbound(&mut peer, |e| matches!(e, ClientEvent::ToolResponse(_))).await;
    let ClientEvent::ToolResponse(responses) = response else {
        unreachable!()
    };
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, "call-9");
    assert_eq!(responses[0].result["rolls"].as_array().unwrap().len(), 2);

    let mut tool_status = h.controller.observers().tool_status.clone();
    within(tool_status.wait_for(|s| s.as_deref() == Some("Rolling the dice..."))).await.unwrap();

    // Model audio clears the status text.
    peer.inbound.send(model_audio(240)).await.unwrap();
    within(tool_status.wait_for(Option::is_none)).await.unwrap();
}

#[tokio::test]
async fn test_model_audio_plays_and_drains_back_to_listening() {
    let mut h = Harness::new();
    let peer = h.open().await;
    peer.inbound.send(model_audio(2400)).await.unwrap();
    peer.inbound.send(model_audio(2400)).await.unwrap();
    h.wait_status(SessionStatus::Speaking).await;

    within(async {
        while h.backend.log.lock().unwrap().scheduled.len() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    let scheduled = h.backend.log.lock().unwrap().scheduled.clone();
    assert_eq!(scheduled, vec![(0, 0.0), (1, 0.1)]);

    h.backend.finish(0);
    h.backend.finish(1);
    h.wait_status(SessionStatus::Listening).await;
}

#[tokio::test]
async fn test_interruption_stops_queued_audio() {
    let mut h = Harness::new();
    let peer = h.open().await;
    for _ in 0..3 {
        peer.inbound.send(model_audio(2400)).await.unwrap();
    }
    peer.inbound.send(ServerEvent::Interrupted).await.unwrap();

    within(async {
        while h.backend.log.lock().unwrap().stopped.len() < 3 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert_eq!(h.backend.log.lock().unwrap().stopped, vec![0, 1, 2]);
    assert_eq!(h.controller.status(), SessionStatus::Speaking);

    // The cursor restarted: the next buffer plays at the clock.
    peer.inbound.send(model_audio(2400)).await.unwrap();
    within(async {
        while h.backend.log.lock().unwrap().scheduled.len() < 4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert_eq!(h.backend.log.lock().unwrap().scheduled[3], (3, 0.0));
}

#[tokio::test]
async fn test_transcript_merges_fragments_per_turn() {
    let mut h = Harness::new();
    let peer = h.open().await;
    for event in [
        ServerEvent::InputTranscript("Hi".to_string()),
        ServerEvent::OutputTranscript("He".to_string()),
        ServerEvent::OutputTranscript("llo".to_string()),
        ServerEvent::TurnComplete,
    ] {
        peer.inbound.send(event).await.unwrap();
    }

    let mut transcript = h.controller.observers().transcript.clone();
    let entries = within(transcript.wait_for(|t| t.len() == 2 && t[1].is_final))
        .await
        .unwrap()
        .clone();
    assert_eq!(entries[0].speaker, Speaker::User);
    assert_eq!(entries[0].text, "Hi");
    assert_eq!(entries[1].speaker, Speaker::Model);
    assert_eq!(entries[1].text, "Hello");
    // The model turn carried no audio, so nothing holds the session in speaking.
    h.wait_status(SessionStatus::Thinking).await;

    // A fresh start clears the transcript.
    h.controller.stop().await.unwrap();
    let _peer = h.open().await;
    assert!(h.controller.transcript().is_empty());
}

#[tokio::test]
async fn test_turn_complete_without_speech_moves_to_thinking() {
    let mut h = Harness::new();
    let mut peer = h.open().await;
    peer.inbound
        .send(ServerEvent::InputTranscript("what time is it".to_string()))
        .await
        .unwrap();
    peer.inbound.send(ServerEvent::TurnComplete).await.unwrap();
    h.wait_status(SessionStatus::Thinking).await;

    peer.inbound
        .send(ServerEvent::OutputTranscript("It is".to_string()))
        .await
        .unwrap();
    h.wait_status(SessionStatus::Speaking).await;
    peer.inbound.send(ServerEvent::TurnComplete).await.unwrap();
    h.wait_status(SessionStatus::Thinking).await;

    h.controller.stop().await.unwrap();
    h.wait_status(SessionStatus::Idle).await;
    assert_eq!(
        next_outbound(&mut peer, |e| matches!(e, ClientEvent::Close)).await,
        ClientEvent::Close
    );
}

#[tokio::test]
async fn test_user_speech_after_barge_in_leaves_speaking() {
    let mut h = Harness::new();
    let peer = h.open().await;
    peer.inbound.send(model_audio(2400)).await.unwrap();
    h.wait_status(SessionStatus::Speaking).await;

    peer.inbound.send(ServerEvent::Interrupted).await.unwrap();
    within(async {
        while h.backend.log.lock().unwrap().stopped.is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;

    peer.inbound
        .send(ServerEvent::InputTranscript("wait, stop".to_string()))
        .await
        .unwrap();
    h.wait_status(SessionStatus::Listening).await;

    peer.inbound.send(ServerEvent::TurnComplete).await.unwrap();
    h.wait_status(SessionStatus::Thinking).await;
}

#[tokio::test]
async fn test_late_model_transcript_after_drain_does_not_hold_speaking() {
    let mut h = Harness::new();
    let peer = h.open().await;
    peer.inbound.send(model_audio(2400)).await.unwrap();
    h.wait_status(SessionStatus::Speaking).await;
    within(async {
        while h.backend.log.lock().unwrap().scheduled.is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    h.backend.finish(0);
    h.wait_status(SessionStatus::Listening).await;

    peer.inbound
        .send(ServerEvent::OutputTranscript("anything else?".to_string()))
        .await
        .unwrap();
    h.wait_status(SessionStatus::Speaking).await;

    peer.inbound
        .send(ServerEvent::InputTranscript("next question".to_string()))
        .await
        .unwrap();
    h.wait_status(SessionStatus::Listening).await;
}

#[tokio::test]
async fn test_text_is_sent_on_the_open_connection() {
    let mut h = Harness::new();
    let mut peer = h.open().await;
    h.controller.send_text("hello there").await.unwrap();
    let event = next_outbound(&mut peer, |e| matches!(e, ClientEvent::Text(_))).await;
    assert_eq!(event, ClientEvent::Text("hello there".to_string()));
}

#[tokio::test]
async fn test_muted_microphone_sends_nothing() {
    let mut h = Harness::new();
    let mut peer = h.open().await;
    h.controller.set_muted(true).await.unwrap();
    let mut muted = h.controller.observers().muted.clone();
    within(muted.wait_for(|m| *m)).await.unwrap();

    h.backend.speak(vec![0.2; FRAME_SIZE]);
    let mut level = h.controller.observers().input_level.clone();
    within(level.wait_for(|l| *l > 0.0)).await.unwrap();
    assert!(peer.outbound.try_recv().is_err());

    h.controller.set_muted(false).await.unwrap();
    within(muted.wait_for(|m| !*m)).await.unwrap();
    h.backend.speak(vec![0.2; FRAME_SIZE]);
    let event = next_outbound(&mut peer, |_| true).await;
    assert!(matches!(event, ClientEvent::Audio(block) if block.mime_type == "audio/pcm;rate=16000"));
}
