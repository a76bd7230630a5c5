//! Gapless scheduling of decoded model audio on an output clock.

use crate::codec::PlaybackBuffer;
use crate::meter::{Meter, rms_level};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Identifies one scheduled buffer on the output device.
pub type VoiceId = u64;

/// Samples around the playhead used for the output level.
const LEVEL_WINDOW: usize = 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaybackError {
    #[error("no output device available")]
    NoDevice,
    #[error("output stream failed: {0}")]
    Stream(String),
}

/// Monotonic output time in seconds since the device opened.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// An output device that plays buffers at absolute clock times.
///
/// When a voice finishes on its own the device reports its id on the
/// channel returned alongside it. Stopped voices are not reported.
pub trait AudioOutput: Send {
    fn clock(&self) -> Arc<dyn OutputClock>;

    fn schedule(
        &mut self,
        voice: VoiceId,
        buffer: Arc<PlaybackBuffer>,
        start_at: f64,
    ) -> Result<(), PlaybackError>;

    fn stop_voice(&mut self, voice: VoiceId);

    fn close(&mut self);
}

#[derive(Clone)]
struct ActiveVoice {
    start_at: f64,
    buffer: Arc<PlaybackBuffer>,
}

impl ActiveVoice {
    fn level_at(&self, now: f64) -> f32 {
        let offset = now - self.start_at;
        if offset < 0.0 {
            return 0.0;
        }
        let Some(samples) = self.buffer.channel(0) else {
            return 0.0;
        };
        let playhead = (offset * self.buffer.sample_rate() as f64) as usize;
        if playhead >= samples.len() {
            return 0.0;
        }
        let end = (playhead + LEVEL_WINDOW).min(samples.len());
        rms_level(&samples[playhead..end])
    }
}

/// Queues model audio back to back on an [`AudioOutput`].
///
/// Each buffer starts at `max(next_start_time, now)` and pushes the cursor by
/// its duration, so consecutive buffers never overlap and never leave a gap
/// unless the clock has already overtaken the queue.
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    clock: Arc<dyn OutputClock>,
    next_start_time: f64,
    next_voice: VoiceId,
    active: BTreeMap<VoiceId, ActiveVoice>,
    latest: Arc<Mutex<Option<(VoiceId, ActiveVoice)>>>,
    meter: Meter,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>, level: Arc<watch::Sender<f32>>) -> Self {
        let clock = output.clock();
        Self {
            output,
            clock,
            next_start_time: 0.0,
            next_voice: 0,
            active: BTreeMap::new(),
            latest: Arc::new(Mutex::new(None)),
            meter: Meter::new(level),
            closed: false,
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Schedules `buffer` after everything already queued. Returns the voice
    /// id and start time, or `None` if nothing was scheduled.
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> Option<(VoiceId, f64)> {
        if self.closed {
            debug!("Ignoring audio for a closed scheduler");
            return None;
        }
        if buffer.frames() == 0 {
            return None;
        }

        let start_at = self.next_start_time.max(self.clock.now());
        let voice = self.next_voice;
        self.next_voice += 1;
        let buffer = Arc::new(buffer);

        if let Err(e) = self.output.schedule(voice, buffer.clone(), start_at) {
            warn!(voice, error = %e, "Dropped an audio buffer that could not be scheduled");
            return None;
        }

        self.next_start_time = start_at + buffer.duration();
        let entry = ActiveVoice { start_at, buffer };
        self.active.insert(voice, entry.clone());
        self.set_latest(Some((voice, entry)));
        self.start_meter();
        Some((voice, start_at))
    }

    /// Records that `voice` finished on its own. Returns `true` when this
    /// emptied the active set.
    pub fn on_voice_ended(&mut self, voice: VoiceId) -> bool {
        if self.active.remove(&voice).is_none() {
            return false;
        }
        if self.latest_id() == Some(voice) {
            self.set_latest(None);
        }
        if self.active.is_empty() {
            self.meter.stop();
            return true;
        }
        false
    }

    /// Silences everything queued and resets the cursor. Used for barge-in.
    pub fn interrupt(&mut self) {
        let stopped = self.active.len();
        for voice in std::mem::take(&mut self.active).into_keys() {
            self.output.stop_voice(voice);
        }
        self.next_start_time = 0.0;
        self.set_latest(None);
        self.meter.stop();
        if stopped > 0 {
            info!(stopped, "Playback interrupted");
        }
    }

    /// Interrupts and releases the output device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.output.close();
        self.closed = true;
    }

    fn start_meter(&mut self) {
        let clock = self.clock.clone();
        let latest = self.latest.clone();
        self.meter.start(move || {
            let current = latest.lock().ok().and_then(|guard| guard.clone());
            current.map_or(0.0, |(_, voice)| voice.level_at(clock.now()))
        });
    }

    fn latest_id(&self) -> Option<VoiceId> {
        self.latest
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|(id, _)| *id))
    }

    fn set_latest(&self, value: Option<(VoiceId, ActiveVoice)>) {
        if let Ok(mut guard) = self.latest.lock() {
            *guard = value;
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
