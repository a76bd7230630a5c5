//! Provider-neutral events exchanged with a live conversational model.

use crate::codec::WireAudioBlock;
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolDeclaration};
use std::time::Duration;

/// Everything the connection handshake needs. Built once per `start()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSetup {
    pub voice_name: String,
    pub system_instruction: String,
    pub language_hint: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub transcribe_input: bool,
    pub transcribe_output: bool,
}

/// Events the remote model emits back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A fragment of the user's transcribed speech.
    InputTranscript(String),
    /// A fragment of the model's transcribed speech.
    OutputTranscript(String),
    /// A chunk of spoken audio from the model.
    Audio(WireAudioBlock),
    /// The model finished its turn.
    TurnComplete,
    /// The user spoke over the model; queued audio is stale.
    Interrupted,
    ToolCall(Vec<ToolCallRequest>),
    ToolCallCancellation(Vec<String>),
    /// The server will close the connection soon.
    GoAway(Option<Duration>),
    Error(String),
    /// The connection ended without an error.
    Closed(Option<String>),
}

/// Events the session sends to the remote model.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Audio(WireAudioBlock),
    Text(String),
    ToolResponse(Vec<ToolCallResponse>),
    /// The microphone stream has ended.
    AudioStreamEnd,
    Close,
}
