//! Gemini Live (`BidiGenerateContent`) transport for `livetalk-core`.

pub mod client;
pub mod types;

pub use client::{ConnectError, GeminiConfig, GeminiConnector};
