//! Level metering.
//!
//! A [`Meter`] is a cancelable periodic task that polls a probe and publishes
//! the result on a `watch` channel. It runs only while audio is flowing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Roughly one display refresh.
pub const METER_INTERVAL: Duration = Duration::from_millis(16);

/// Speech RMS rarely exceeds 0.25; scale it into a usable `[0, 1]` range.
pub const LEVEL_GAIN: f32 = 4.0;

/// Loudness of a block of samples, clamped to `[0, 1]`.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let level = energy.sqrt() * LEVEL_GAIN;
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

/// A level value shared between the audio path and a meter probe.
#[derive(Clone, Debug, Default)]
pub struct SharedLevel(Arc<AtomicU32>);

impl SharedLevel {
    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

pub struct Meter {
    publish: Arc<watch::Sender<f32>>,
    task: Option<JoinHandle<()>>,
}

impl Meter {
    pub fn new(publish: Arc<watch::Sender<f32>>) -> Self {
        Self {
            publish,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts polling `probe` every [`METER_INTERVAL`]. No-op if already running.
    pub fn start<F>(&mut self, probe: F)
    where
        F: Fn() -> f32 + Send + 'static,
    {
        if self.is_running() {
            return;
        }
        let publish = self.publish.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METER_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let level = probe();
                publish.send_if_modified(|current| {
                    if *current == level {
                        false
                    } else {
                        *current = level;
                        true
                    }
                });
            }
        }));
    }

    /// Cancels polling and publishes silence.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.publish.send_replace(0.0);
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
