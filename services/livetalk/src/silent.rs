//! A device backend without hardware: the microphone never produces audio
//! and the speaker discards buffers after their play time.

use livetalk_core::AudioBackend;
use livetalk_core::capture::{CaptureDevice, CaptureError};
use livetalk_core::codec::PlaybackBuffer;
use livetalk_core::playback::{AudioOutput, OutputClock, PlaybackError, VoiceId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct SilentBackend;

impl AudioBackend for SilentBackend {
    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Ok(Box::new(SilentMic { keep_open: None }))
    }

    fn open_output(
        &self,
    ) -> Result<(Box<dyn AudioOutput>, mpsc::UnboundedReceiver<VoiceId>), PlaybackError> {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = SilentOutput {
            clock: Arc::new(WallClock(Instant::now())),
            ended: ended_tx,
            timers: HashMap::new(),
        };
        Ok((Box::new(output), ended_rx))
    }
}

struct SilentMic {
    keep_open: Option<mpsc::UnboundedSender<Vec<f32>>>,
}

impl CaptureDevice for SilentMic {
    fn open(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<f32>>, CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.keep_open = Some(tx);
        Ok(rx)
    }

    fn close(&mut self) {
        self.keep_open = None;
    }
}

struct WallClock(Instant);

impl OutputClock for WallClock {
    fn now(&self) -> f64 {
        self.0.elapsed().as_secs_f64()
    }
}

struct SilentOutput {
    clock: Arc<WallClock>,
    ended: mpsc::UnboundedSender<VoiceId>,
    timers: HashMap<VoiceId, JoinHandle<()>>,
}

impl AudioOutput for SilentOutput {
    fn clock(&self) -> Arc<dyn OutputClock> {
        self.clock.clone()
    }

    fn schedule(
        &mut self,
        voice: VoiceId,
        buffer: Arc<PlaybackBuffer>,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        let ends_in = (start_at + buffer.duration() - self.clock.now()).max(0.0);
        let ended = self.ended.clone();
        self.timers.retain(|_, timer| !timer.is_finished());
        self.timers.insert(
            voice,
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(ends_in)).await;
                let _ = ended.send(voice);
            }),
        );
        Ok(())
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        if let Some(timer) = self.timers.remove(&voice) {
            timer.abort();
        }
    }

    fn close(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}
