use crate::capture::CaptureError;
use crate::codec::CodecError;
use crate::playback::PlaybackError;

/// Failures surfaced by the session engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("microphone unavailable: {0}")]
    Capture(#[from] CaptureError),

    #[error("audio output unavailable: {0}")]
    Playback(#[from] PlaybackError),

    #[error("audio codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("session controller is no longer running")]
    ControllerGone,
}
