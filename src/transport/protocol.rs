//! JSON wire format of the streaming conversation channel.
//!
//! Outbound: one `setup` handshake, then `clientContent` text turns and
//! `realtimeInput` audio chunks. Inbound: `setupComplete`, then
//! `serverContent` carrying text parts, transcriptions of both sides, inline
//! audio and the `turnComplete`/`interrupted` flags.

use crate::audio::pcm::PcmFrame;
use crate::defaults;
use crate::error::{ReflectaError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;

/// A message sent from the engine to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Opening handshake. Sent exactly once per connection.
    Setup {
        model: String,
        voice: String,
        system_instruction: Option<String>,
    },
    /// One complete user text turn.
    Text(String),
    /// One captured microphone frame.
    Audio(PcmFrame),
}

impl OutboundMessage {
    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            OutboundMessage::Setup {
                model,
                voice,
                system_instruction,
            } => {
                let mut setup = json!({
                    "model": model,
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {
                                "prebuiltVoiceConfig": { "voiceName": voice }
                            }
                        }
                    },
                    "inputAudioTranscription": {},
                    "outputAudioTranscription": {}
                });
                if let Some(instruction) = system_instruction {
                    setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
                }
                json!({ "setup": setup })
            }
            OutboundMessage::Text(text) => json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                    "turnComplete": true
                }
            }),
            OutboundMessage::Audio(frame) => json!({
                "realtimeInput": {
                    "mediaChunks": [{
                        "mimeType": format!("audio/pcm;rate={}", frame.sample_rate),
                        "data": STANDARD.encode(frame.to_le_bytes())
                    }]
                }
            }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// A message received from the backend, already split into engine terms.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    SetupComplete,
    /// Piece of the reply text. `is_final` closes the current reply.
    Fragment { text: String, is_final: bool },
    /// Piece of what the user said, transcribed by the backend.
    Transcript { text: String },
    /// Reply audio, 16-bit mono.
    Audio(PcmFrame),
    /// The backend stopped talking because the user barged in.
    Interrupted,
    /// Unrecoverable failure reported by the backend or the socket.
    Error { message: String },
    /// The channel closed normally.
    Closed,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    error: Option<ServerError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    turn_complete: bool,
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelTurn {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Transcription {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerError {
    message: String,
}

/// Decode one server frame into zero or more inbound messages, in the order
/// they must be applied.
///
/// Fields the engine does not use (usage metadata, tool calls) are ignored.
///
/// # Errors
/// Returns `ReflectaError::Protocol` for invalid JSON or undecodable audio.
pub fn decode_server_message(payload: &[u8]) -> Result<Vec<InboundMessage>> {
    let message: ServerMessage =
        serde_json::from_slice(payload).map_err(|e| ReflectaError::Protocol {
            message: format!("invalid server message: {}", e),
        })?;

    let mut decoded = Vec::new();

    if message.setup_complete.is_some() {
        decoded.push(InboundMessage::SetupComplete);
    }

    if let Some(error) = message.error {
        decoded.push(InboundMessage::Error {
            message: error.message,
        });
    }

    let Some(content) = message.server_content else {
        return Ok(decoded);
    };

    if content.interrupted {
        decoded.push(InboundMessage::Interrupted);
    }

    // The user's words precede the reply they prompted
    if let Some(transcription) = content.input_transcription
        && !transcription.text.is_empty()
    {
        decoded.push(InboundMessage::Transcript {
            text: transcription.text,
        });
    }

    let mut saw_text = false;
    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(text) = part.text
                && !text.is_empty()
            {
                saw_text = true;
                decoded.push(InboundMessage::Fragment {
                    text,
                    is_final: false,
                });
            }
            if let Some(inline) = part.inline_data {
                decoded.push(InboundMessage::Audio(decode_audio(&inline)?));
            }
        }
    }

    // Audio-only turns carry their words in the transcription instead
    if !saw_text
        && let Some(transcription) = content.output_transcription
        && !transcription.text.is_empty()
    {
        decoded.push(InboundMessage::Fragment {
            text: transcription.text,
            is_final: false,
        });
    }

    if content.turn_complete {
        decoded.push(InboundMessage::Fragment {
            text: String::new(),
            is_final: true,
        });
    }

    Ok(decoded)
}

fn decode_audio(inline: &InlineData) -> Result<PcmFrame> {
    let bytes = STANDARD
        .decode(inline.data.as_bytes())
        .map_err(|e| ReflectaError::Protocol {
            message: format!("invalid base64 audio: {}", e),
        })?;
    PcmFrame::from_le_bytes(&bytes, mime_sample_rate(&inline.mime_type))
}

/// Sample rate from a mime type like `audio/pcm;rate=24000`.
fn mime_sample_rate(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(defaults::PLAYBACK_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(encoded: &str) -> Value {
        serde_json::from_str(encoded).unwrap()
    }

    #[test]
    fn test_setup_carries_model_voice_and_instruction() {
        let encoded = OutboundMessage::Setup {
            model: "models/live".to_string(),
            voice: "Aoede".to_string(),
            system_instruction: Some("Interview the user".to_string()),
        }
        .encode()
        .unwrap();
        let value = parse(&encoded);

        assert_eq!(value["setup"]["model"], "models/live");
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Aoede"
        );
        assert_eq!(
            value["setup"]["systemInstruction"]["parts"][0]["text"],
            "Interview the user"
        );
        assert!(value["setup"]["inputAudioTranscription"].is_object());
        assert!(value["setup"]["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_setup_without_instruction_omits_field() {
        let encoded = OutboundMessage::Setup {
            model: "m".to_string(),
            voice: "v".to_string(),
            system_instruction: None,
        }
        .encode()
        .unwrap();
        assert!(parse(&encoded)["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_text_is_a_complete_user_turn() {
        let value = parse(&OutboundMessage::Text("안녕하세요".to_string()).encode().unwrap());
        let content = &value["clientContent"];
        assert_eq!(content["turns"][0]["role"], "user");
        assert_eq!(content["turns"][0]["parts"][0]["text"], "안녕하세요");
        assert_eq!(content["turnComplete"], true);
    }

    #[test]
    fn test_audio_is_base64_pcm_with_rate() {
        let frame = PcmFrame::new(vec![1, -1, 256], 16000);
        let value = parse(&OutboundMessage::Audio(frame.clone()).encode().unwrap());
        let chunk = &value["realtimeInput"]["mediaChunks"][0];

        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        let bytes = STANDARD.decode(chunk["data"].as_str().unwrap()).unwrap();
        assert_eq!(bytes, frame.to_le_bytes());
    }

    #[test]
    fn test_decodes_setup_complete() {
        let decoded = decode_server_message(br#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(decoded, vec![InboundMessage::SetupComplete]);
    }

    #[test]
    fn test_decodes_text_parts_then_turn_complete() {
        let payload = br#"{"serverContent":{"modelTurn":{"parts":[{"text":"Hel"},{"text":"lo"}]},"turnComplete":true}}"#;
        let decoded = decode_server_message(payload).unwrap();
        assert_eq!(
            decoded,
            vec![
                InboundMessage::Fragment {
                    text: "Hel".to_string(),
                    is_final: false
                },
                InboundMessage::Fragment {
                    text: "lo".to_string(),
                    is_final: false
                },
                InboundMessage::Fragment {
                    text: String::new(),
                    is_final: true
                },
            ]
        );
    }

    #[test]
    fn test_transcription_used_for_audio_only_turns() {
        let data = STANDARD.encode([0u8, 1, 2, 3]);
        let payload = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}},"outputTranscription":{{"text":"어떤 점이"}}}}}}"#,
            data
        );
        let decoded = decode_server_message(payload.as_bytes()).unwrap();

        assert_eq!(decoded.len(), 2);
        match &decoded[0] {
            InboundMessage::Audio(frame) => {
                assert_eq!(frame.sample_rate, 24000);
                assert_eq!(frame.samples, vec![256, 770]);
            }
            other => panic!("Expected audio, got {:?}", other),
        }
        assert_eq!(
            decoded[1],
            InboundMessage::Fragment {
                text: "어떤 점이".to_string(),
                is_final: false
            }
        );
    }

    #[test]
    fn test_input_transcription_precedes_reply_text() {
        let payload = r#"{"serverContent":{"inputTranscription":{"text":" 좋았어요"},"modelTurn":{"parts":[{"text":"왜요?"}]}}}"#.as_bytes();
        let decoded = decode_server_message(payload).unwrap();
        assert_eq!(
            decoded,
            vec![
                InboundMessage::Transcript {
                    text: " 좋았어요".to_string()
                },
                InboundMessage::Fragment {
                    text: "왜요?".to_string(),
                    is_final: false
                },
            ]
        );
    }

    #[test]
    fn test_empty_input_transcription_is_skipped() {
        let payload = br#"{"serverContent":{"inputTranscription":{"text":""}}}"#;
        assert!(decode_server_message(payload).unwrap().is_empty());
    }

    #[test]
    fn test_interrupted_comes_first() {
        let payload = br#"{"serverContent":{"interrupted":true,"turnComplete":true}}"#;
        let decoded = decode_server_message(payload).unwrap();
        assert_eq!(decoded[0], InboundMessage::Interrupted);
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_server_error_is_decoded() {
        let decoded = decode_server_message(br#"{"error":{"message":"quota"}}"#).unwrap();
        assert_eq!(
            decoded,
            vec![InboundMessage::Error {
                message: "quota".to_string()
            }]
        );
    }

    #[test]
    fn test_unknown_fields_decode_to_nothing() {
        let decoded = decode_server_message(br#"{"usageMetadata":{"totalTokenCount":5}}"#).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        assert!(matches!(
            decode_server_message(b"{not json"),
            Err(ReflectaError::Protocol { .. })
        ));
    }

    #[test]
    fn test_mime_rate_defaults_to_playback_rate() {
        assert_eq!(mime_sample_rate("audio/pcm;rate=16000"), 16000);
        assert_eq!(mime_sample_rate("audio/pcm"), 24000);
        assert_eq!(mime_sample_rate("audio/pcm; rate=abc"), 24000);
    }
}
