//! Serde types for the Gemini Live `BidiGenerateContent` messages.

use livetalk_core::codec::WireAudioBlock;
use livetalk_core::events::{ClientEvent, ServerEvent, SessionSetup};
use livetalk_core::tools::{ToolCallRequest, ToolCallResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl Setup {
    pub fn from_session(model: &str, setup: &SessionSetup) -> Self {
        let system_instruction = (!setup.system_instruction.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part {
                text: setup.system_instruction.clone(),
            }],
        });
        let tools = if setup.tools.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: setup
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                    language_code: setup.language_hint.clone(),
                },
            },
            system_instruction,
            tools,
            input_audio_transcription: setup.transcribe_input.then_some(AudioTranscriptionConfig {}),
            output_audio_transcription: setup
                .transcribe_output
                .then_some(AudioTranscriptionConfig {}),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Serializes as `{}`; its presence switches transcription on.
#[derive(Debug, Serialize)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl ClientMessage {
    /// Maps an engine event to its wire message. `Close` has no message; the
    /// writer closes the socket instead.
    pub fn from_event(event: ClientEvent) -> Option<Self> {
        let message = match event {
            ClientEvent::Audio(block) => Self::RealtimeInput(RealtimeInput {
                audio: Some(Blob {
                    mime_type: block.mime_type,
                    data: block.data,
                }),
                audio_stream_end: None,
            }),
            ClientEvent::Text(text) => Self::ClientContent(ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![Part { text }],
                }],
                turn_complete: true,
            }),
            ClientEvent::ToolResponse(responses) => Self::ToolResponse(ToolResponse {
                function_responses: responses
                    .into_iter()
                    .map(|ToolCallResponse { id, name, result }| FunctionResponse {
                        id,
                        name,
                        response: result,
                    })
                    .collect(),
            }),
            ClientEvent::AudioStreamEnd => Self::RealtimeInput(RealtimeInput {
                audio: None,
                audio_stream_end: Some(true),
            }),
            ClientEvent::Close => return None,
        };
        Some(message)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCall>,
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<ServerBlob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerBlob {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Transcription {
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCall {
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ToolCallCancellation {
    pub ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// Parses a protobuf JSON duration such as `"12.5s"`.
fn parse_duration(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().strip_suffix('s')?.parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flattens one message into engine events, in the order the engine
    /// must apply them: an interruption first, turn completion last.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            if content.interrupted == Some(true) {
                events.push(ServerEvent::Interrupted);
            }
            if let Some(transcription) = content.input_transcription {
                events.push(ServerEvent::InputTranscript(transcription.text));
            }
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        events.push(ServerEvent::Audio(WireAudioBlock {
                            mime_type: blob
                                .mime_type
                                .unwrap_or_else(|| "audio/pcm;rate=24000".to_string()),
                            data: blob.data,
                        }));
                    }
                }
            }
            if let Some(transcription) = content.output_transcription {
                events.push(ServerEvent::OutputTranscript(transcription.text));
            }
            if let Some(calls) = self.tool_call {
                push_tool_calls(&mut events, calls);
            }
            if content.turn_complete == Some(true) {
                events.push(ServerEvent::TurnComplete);
            }
        } else if let Some(calls) = self.tool_call {
            push_tool_calls(&mut events, calls);
        }

        if let Some(cancellation) = self.tool_call_cancellation {
            events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
        }
        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway(
                go_away.time_left.as_deref().and_then(parse_duration),
            ));
        }
        events
    }
}

fn push_tool_calls(events: &mut Vec<ServerEvent>, calls: ToolCall) {
    if calls.function_calls.is_empty() {
        return;
    }
    events.push(ServerEvent::ToolCall(
        calls
            .function_calls
            .into_iter()
            .map(|call| ToolCallRequest {
                id: call.id,
                name: call.name,
                args: call.args,
            })
            .collect(),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetalk_core::tools::ToolDeclaration;
    use serde_json::json;

    #[test]
    fn test_setup_serialization() {
        let setup = SessionSetup {
            voice_name: "Puck".to_string(),
            system_instruction: "Be brief.".to_string(),
            language_hint: Some("en-US".to_string()),
            tools: vec![ToolDeclaration {
                name: "roll_dice".to_string(),
                description: "Rolls dice.".to_string(),
                parameters: json!({"type": "object"}),
            }],
            transcribe_input: true,
            transcribe_output: true,
        };
        let message = ClientMessage::Setup(Setup::from_session("models/live", &setup));
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/live",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Puck" } },
                            "languageCode": "en-US"
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] },
                    "tools": [{
                        "functionDeclarations": [{
                            "name": "roll_dice",
                            "description": "Rolls dice.",
                            "parameters": { "type": "object" }
                        }]
                    }],
                    "inputAudioTranscription": {},
                    "outputAudioTranscription": {}
                }
            })
        );
    }

    #[test]
    fn test_minimal_setup_omits_optional_fields() {
        let setup = SessionSetup {
            voice_name: "Zephyr".to_string(),
            ..SessionSetup::default()
        };
        let value = serde_json::to_value(ClientMessage::Setup(Setup::from_session("m", &setup))).unwrap();
        let setup = &value["setup"];
        assert!(setup.get("systemInstruction").is_none());
        assert!(setup.get("tools").is_none());
        assert!(setup.get("inputAudioTranscription").is_none());
        assert!(setup["generationConfig"]["speechConfig"].get("languageCode").is_none());
    }

    #[test]
    fn test_outbound_events() {
        let audio = ClientMessage::from_event(ClientEvent::Audio(WireAudioBlock {
            data: "AAA=".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        }))
        .unwrap();
        assert_eq!(
            serde_json::to_value(audio).unwrap(),
            json!({"realtimeInput": {"audio": {"mimeType": "audio/pcm;rate=16000", "data": "AAA="}}})
        );

        let text = ClientMessage::from_event(ClientEvent::Text("hi".to_string())).unwrap();
        assert_eq!(
            serde_json::to_value(text).unwrap(),
            json!({"clientContent": {"turns": [{"role": "user", "parts": [{"text": "hi"}]}], "turnComplete": true}})
        );

        let response = ClientMessage::from_event(ClientEvent::ToolResponse(vec![ToolCallResponse {
            id: "c1".to_string(),
            name: "roll_dice".to_string(),
            result: json!({"total": 4}),
        }]))
        .unwrap();
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({"toolResponse": {"functionResponses": [{"id": "c1", "name": "roll_dice", "response": {"total": 4}}]}})
        );

        let end = ClientMessage::from_event(ClientEvent::AudioStreamEnd).unwrap();
        assert_eq!(
            serde_json::to_value(end).unwrap(),
            json!({"realtimeInput": {"audioStreamEnd": true}})
        );

        assert!(ClientMessage::from_event(ClientEvent::Close).is_none());
    }

    #[test]
    fn test_parse_setup_complete() {
        let message = parse_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert!(message.is_setup_complete());
        assert!(message.into_events().is_empty());
    }

    #[test]
    fn test_parse_server_content_in_order() {
        let text = r#"{
            "serverContent": {
                "interrupted": true,
                "inputTranscription": {"text": "stop"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                    {"text": "ignored"},
                    {"inlineData": {"data": "BBBB"}}
                ]},
                "outputTranscription": {"text": "Sure"},
                "turnComplete": true
            }
        }"#;
        let events = parse_server_message(text).unwrap().into_events();
        assert_eq!(
            events,
            vec![
                ServerEvent::Interrupted,
                ServerEvent::InputTranscript("stop".to_string()),
                ServerEvent::Audio(WireAudioBlock {
                    data: "AAAA".to_string(),
                    mime_type: "audio/pcm;rate=24000".to_string(),
                }),
                ServerEvent::Audio(WireAudioBlock {
                    data: "BBBB".to_string(),
                    mime_type: "audio/pcm;rate=24000".to_string(),
                }),
                ServerEvent::OutputTranscript("Sure".to_string()),
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_parse_tool_call_and_cancellation() {
        let call = r#"{"toolCall": {"functionCalls": [{"id": "f-1", "name": "get_current_time", "args": {}}]}}"#;
        let events = parse_server_message(call).unwrap().into_events();
        assert_eq!(
            events,
            vec![ServerEvent::ToolCall(vec![ToolCallRequest {
                id: "f-1".to_string(),
                name: "get_current_time".to_string(),
                args: json!({}),
            }])]
        );

        let cancel = r#"{"toolCallCancellation": {"ids": ["f-1"]}}"#;
        assert_eq!(
            parse_server_message(cancel).unwrap().into_events(),
            vec![ServerEvent::ToolCallCancellation(vec!["f-1".to_string()])]
        );
    }

    #[test]
    fn test_parse_go_away() {
        let events = parse_server_message(r#"{"goAway": {"timeLeft": "12.5s"}}"#)
            .unwrap()
            .into_events();
        assert_eq!(events, vec![ServerEvent::GoAway(Some(Duration::from_millis(12_500)))]);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let text = r#"{"usageMetadata": {"totalTokenCount": 12}, "serverContent": {"generationComplete": true}}"#;
        assert!(parse_server_message(text).unwrap().into_events().is_empty());
        assert!(parse_server_message("not json").is_err());
    }
}
