//! Microphone and speaker access through `cpal`.
//!
//! `cpal::Stream` is not `Send`, so each stream lives on its own thread that
//! builds it, reports readiness and then parks until told to stop.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, SampleFormat, Stream, StreamConfig};
use livetalk_core::AudioBackend;
use livetalk_core::capture::{CaptureDevice, CaptureError};
use livetalk_core::codec::{
    self, CAPTURE_SAMPLE_RATE, CodecError, PLAYBACK_SAMPLE_RATE, PlaybackBuffer, RESAMPLER_CHUNK,
    StreamResampler,
};
use livetalk_core::playback::{AudioOutput, OutputClock, PlaybackError, VoiceId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let host = cpal::default_host();
        if host.default_input_device().is_none() {
            return Err(CaptureError::NoDevice);
        }
        Ok(Box::new(CpalMic { stream: None }))
    }

    fn open_output(
        &self,
    ) -> Result<(Box<dyn AudioOutput>, mpsc::UnboundedReceiver<VoiceId>), PlaybackError> {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = CpalSpeaker::open(ended_tx)?;
        Ok((Box::new(output), ended_rx))
    }
}

/// Keeps a stream thread alive; dropping it stops the stream.
struct StreamThread {
    stop: std_mpsc::Sender<()>,
}

impl StreamThread {
    fn spawn<E, F>(name: &str, build: F) -> Result<Self, E>
    where
        E: Send + 'static + From<String>,
        F: FnOnce() -> Result<Stream, E> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), E>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(E::from(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Returns once the owner sends or is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| E::from(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| E::from("audio thread exited before starting".to_string()))??;
        Ok(Self { stop: stop_tx })
    }

    fn stop(self) {
        let _ = self.stop.send(());
    }
}

/// Wraps a message as a stream error for [`StreamThread::spawn`].
struct CaptureFailure(CaptureError);

impl From<String> for CaptureFailure {
    fn from(message: String) -> Self {
        Self(CaptureError::Stream(message))
    }
}

struct PlaybackFailure(PlaybackError);

impl From<String> for PlaybackFailure {
    fn from(message: String) -> Self {
        Self(PlaybackError::Stream(message))
    }
}

fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

struct CpalMic {
    stream: Option<StreamThread>,
}

impl CaptureDevice for CpalMic {
    fn open(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<f32>>, CaptureError> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let stream = StreamThread::spawn("livetalk-capture", move || build_input(chunk_tx))
            .map_err(|CaptureFailure(e)| e)?;
        self.stream = Some(stream);
        Ok(chunk_rx)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
    }
}

fn build_input(chunks: mpsc::UnboundedSender<Vec<f32>>) -> Result<Stream, CaptureFailure> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureFailure(CaptureError::NoDevice))?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureFailure(CaptureError::PermissionDenied(e.to_string())))?;

    let channels = supported.channels() as usize;
    let rate = supported.sample_rate().0;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    info!(
        device = %device.name().unwrap_or_default(),
        rate, channels, ?format, "Opening microphone"
    );

    let mut resampler = StreamResampler::new(rate, CAPTURE_SAMPLE_RATE)
        .map_err(|e| CaptureFailure(CaptureError::Stream(e.to_string())))?;
    let mut forward = move |mono: Vec<f32>| {
        let samples = resampler.process(&mono);
        if !samples.is_empty() {
            // Fails only after the capture line went away.
            let _ = chunks.send(samples);
        }
    };
    let on_error = |e: cpal::StreamError| warn!(error = %e, "Microphone stream error");

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| forward(downmix(data, channels)),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                forward(downmix(&samples, channels));
            },
            on_error,
            None,
        ),
        other => {
            return Err(CaptureFailure(CaptureError::Stream(format!(
                "unsupported input sample format {other:?}"
            ))));
        }
    };
    stream.map_err(|e| CaptureFailure(input_error(e)))
}

fn input_error(e: BuildStreamError) -> CaptureError {
    match e {
        BuildStreamError::DeviceNotAvailable => CaptureError::NoDevice,
        other => CaptureError::Stream(other.to_string()),
    }
}

/// Voices waiting for or in playback, positioned on the device's frame clock.
struct Mixer {
    voices: BTreeMap<VoiceId, MixVoice>,
    ended: mpsc::UnboundedSender<VoiceId>,
}

struct MixVoice {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Mixer {
    /// Renders `frames` mono samples starting at `position` and reports the
    /// voices that finished inside them.
    fn render(&mut self, position: u64, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames];
        let window_end = position + frames as u64;
        for voice in self.voices.values() {
            let voice_end = voice.start_frame + voice.samples.len() as u64;
            if voice_end <= position || voice.start_frame >= window_end {
                continue;
            }
            let from = voice.start_frame.max(position);
            let to = voice_end.min(window_end);
            for t in from..to {
                out[(t - position) as usize] += voice.samples[(t - voice.start_frame) as usize];
            }
        }

        let finished: Vec<VoiceId> = self
            .voices
            .iter()
            .filter(|(_, v)| v.start_frame + v.samples.len() as u64 <= window_end)
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.voices.remove(&id);
            let _ = self.ended.send(id);
        }

        for sample in &mut out {
            *sample = sample.clamp(-1.0, 1.0);
        }
        out
    }
}

struct FrameClock {
    position: Arc<AtomicU64>,
    rate: u32,
}

impl OutputClock for FrameClock {
    fn now(&self) -> f64 {
        self.position.load(Ordering::Acquire) as f64 / self.rate as f64
    }
}

/// Resamples scheduled buffers to the device rate as one continuous signal.
///
/// Back-to-back buffers share resampler state so chunk edges stay smooth. A
/// run starts with one resampler chunk of silence, which keeps enough output
/// in hand that no buffer has to be padded mid-run.
struct VoiceStream {
    device_rate: u32,
    source_rate: u32,
    resampler: StreamResampler,
    carry: Vec<f32>,
    next_frame: Option<u64>,
}

impl VoiceStream {
    fn new(device_rate: u32) -> Result<Self, CodecError> {
        Ok(Self {
            device_rate,
            source_rate: PLAYBACK_SAMPLE_RATE,
            resampler: StreamResampler::new(PLAYBACK_SAMPLE_RATE, device_rate)?,
            carry: Vec::new(),
            next_frame: None,
        })
    }

    fn lead_in(&self) -> usize {
        if self.source_rate == self.device_rate {
            return 0;
        }
        (RESAMPLER_CHUNK as u64 * self.device_rate as u64).div_ceil(self.source_rate as u64) as usize
    }

    /// Device-rate samples for `buffer`, exactly as long as the scheduler
    /// expects it to play.
    fn shape(&mut self, buffer: &PlaybackBuffer, start_frame: u64) -> Result<Vec<f32>, CodecError> {
        let contiguous =
            self.next_frame == Some(start_frame) && self.source_rate == buffer.sample_rate();
        if !contiguous {
            self.source_rate = buffer.sample_rate();
            self.resampler = StreamResampler::new(self.source_rate, self.device_rate)?;
            self.carry = vec![0.0; self.lead_in()];
        }

        let expected = (buffer.duration() * self.device_rate as f64).round() as usize;
        self.carry.extend(self.resampler.process(&buffer.mixdown()));
        let take = expected.min(self.carry.len());
        let mut samples: Vec<f32> = self.carry.drain(..take).collect();
        samples.resize(expected, 0.0);

        self.next_frame = Some(start_frame + expected as u64);
        Ok(samples)
    }

    fn reset(&mut self) {
        self.next_frame = None;
        self.carry.clear();
    }
}

struct CpalSpeaker {
    mixer: Arc<Mutex<Mixer>>,
    clock: Arc<FrameClock>,
    voices: VoiceStream,
    stream: Option<StreamThread>,
}

impl CpalSpeaker {
    fn open(ended: mpsc::UnboundedSender<VoiceId>) -> Result<Self, PlaybackError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(PlaybackError::NoDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;
        let rate = supported.sample_rate().0;

        let mixer = Arc::new(Mutex::new(Mixer {
            voices: BTreeMap::new(),
            ended,
        }));
        let position = Arc::new(AtomicU64::new(0));

        let stream_mixer = mixer.clone();
        let stream_position = position.clone();
        let stream = StreamThread::spawn("livetalk-playback", move || {
            build_output(&device, supported, stream_mixer, stream_position)
        })
        .map_err(|PlaybackFailure(e)| e)?;

        Ok(Self {
            mixer,
            clock: Arc::new(FrameClock { position, rate }),
            voices: VoiceStream::new(rate).map_err(|e| PlaybackError::Stream(e.to_string()))?,
            stream: Some(stream),
        })
    }
}

fn build_output(
    device: &cpal::Device,
    supported: cpal::SupportedStreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    position: Arc<AtomicU64>,
) -> Result<Stream, PlaybackFailure> {
    let channels = supported.channels() as usize;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    info!(
        device = %device.name().unwrap_or_default(),
        rate = config.sample_rate.0, channels, ?format, "Opening speaker"
    );

    let mut next_block = move |frames: usize| -> Vec<f32> {
        let at = position.load(Ordering::Acquire);
        let block = match mixer.lock() {
            Ok(mut mixer) => mixer.render(at, frames),
            Err(_) => vec![0.0; frames],
        };
        position.store(at + frames as u64, Ordering::Release);
        block
    };
    let on_error = |e: cpal::StreamError| warn!(error = %e, "Speaker stream error");

    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let block = next_block(data.len() / channels);
                for (frame, sample) in data.chunks_mut(channels).zip(block) {
                    frame.fill(sample);
                }
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _| {
                let block = next_block(data.len() / channels);
                for (frame, sample) in data.chunks_mut(channels).zip(block) {
                    frame.fill(codec::quantize(sample));
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(PlaybackFailure(PlaybackError::Stream(format!(
                "unsupported output sample format {other:?}"
            ))));
        }
    };
    stream.map_err(|e| PlaybackFailure(PlaybackError::Stream(e.to_string())))
}

impl AudioOutput for CpalSpeaker {
    fn clock(&self) -> Arc<dyn OutputClock> {
        self.clock.clone()
    }

    fn schedule(
        &mut self,
        voice: VoiceId,
        buffer: Arc<PlaybackBuffer>,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        let start_frame = (start_at * self.clock.rate as f64).round() as u64;
        let samples = self
            .voices
            .shape(&buffer, start_frame)
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| PlaybackError::Stream("mixer poisoned".to_string()))?;
        mixer.voices.insert(voice, MixVoice { start_frame, samples });
        debug!(voice, start_at, "Voice scheduled");
        Ok(())
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        self.voices.reset();
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.remove(&voice);
        }
    }

    fn close(&mut self) {
        self.voices.reset();
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.clear();
        }
        if let Some(stream) = self.stream.take() {
            stream.stop();
            info!("Speaker closed");
        }
    }
}
