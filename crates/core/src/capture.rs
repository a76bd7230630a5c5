//! Microphone capture: framing, level metering and the mute gate.

use crate::codec::{self, CAPTURE_SAMPLE_RATE};
use crate::events::ClientEvent;
use crate::meter::{SharedLevel, rms_level};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Samples per frame sent to the remote model (256 ms at 16 kHz).
pub const FRAME_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("no input device available")]
    NoDevice,
    #[error("permission to record was denied: {0}")]
    PermissionDenied(String),
    #[error("input stream failed: {0}")]
    Stream(String),
}

/// A source of mono f32 audio at [`CAPTURE_SAMPLE_RATE`].
pub trait CaptureDevice: Send {
    /// Starts recording. Chunks of any size arrive on the returned channel
    /// until [`CaptureDevice::close`] is called.
    fn open(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<f32>>, CaptureError>;

    fn close(&mut self);
}

/// Slices arbitrarily sized chunks into exact [`FRAME_SIZE`] frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn push(&mut self, chunk: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(chunk);
        let whole = self.pending.len() / FRAME_SIZE;
        let frames = self
            .pending
            .chunks_exact(FRAME_SIZE)
            .map(<[f32]>::to_vec)
            .collect();
        self.pending.drain(..whole * FRAME_SIZE);
        frames
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Owns one capture device for the lifetime of a session.
///
/// Frames are always metered. They reach the wire only when a sink is
/// attached and the line is not muted.
pub struct CaptureLine {
    device: Option<Box<dyn CaptureDevice>>,
    task: Option<JoinHandle<()>>,
    muted: Arc<AtomicBool>,
    sink: watch::Sender<Option<mpsc::Sender<ClientEvent>>>,
    level: SharedLevel,
    frames: Arc<AtomicU64>,
}

impl Default for CaptureLine {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureLine {
    pub fn new() -> Self {
        Self {
            device: None,
            task: None,
            muted: Arc::new(AtomicBool::new(false)),
            sink: watch::Sender::new(None),
            level: SharedLevel::default(),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Acquires `device` and begins framing its audio. A failure leaves the
    /// line stopped; there is no retry.
    pub fn start(&mut self, mut device: Box<dyn CaptureDevice>) -> Result<(), CaptureError> {
        self.stop();
        let mut chunks = device.open()?;
        info!(frame_size = FRAME_SIZE, "Microphone capture started");

        let muted = self.muted.clone();
        let sink = self.sink.subscribe();
        let level = self.level.clone();
        let frames = self.frames.clone();

        self.device = Some(device);
        self.task = Some(tokio::spawn(async move {
            let mut assembler = FrameAssembler::default();
            while let Some(chunk) = chunks.recv().await {
                for frame in assembler.push(&chunk) {
                    level.set(rms_level(&frame));
                    frames.fetch_add(1, Ordering::Relaxed);
                    if muted.load(Ordering::Relaxed) {
                        continue;
                    }
                    let Some(tx) = sink.borrow().clone() else {
                        continue;
                    };
                    let block = codec::encode(&frame, CAPTURE_SAMPLE_RATE);
                    if let Err(e) = tx.try_send(ClientEvent::Audio(block)) {
                        warn!(error = %e, "Dropped a microphone frame");
                    }
                }
            }
            debug!(leftover = assembler.pending(), "Capture stream ended");
        }));
        Ok(())
    }

    /// Starts forwarding frames to `tx`.
    pub fn attach(&self, tx: mpsc::Sender<ClientEvent>) {
        self.sink.send_replace(Some(tx));
    }

    pub fn detach(&self) {
        self.sink.send_replace(None);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// The level probe read by the input meter.
    pub fn level(&self) -> SharedLevel {
        self.level.clone()
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Releases the device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.detach();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut device) = self.device.take() {
            device.close();
            info!("Microphone capture stopped");
        }
        self.level.set(0.0);
    }
}

impl Drop for CaptureLine {
    fn drop(&mut self) {
        self.stop();
    }
}
