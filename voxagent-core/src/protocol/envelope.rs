//! Envelope schema and its encode/decode contract.
//!
//! The backend serialises its update dataclasses directly, so decoding is
//! lenient: missing ids default to empty strings, `null` optionals are
//! accepted, and unknown extra fields are ignored. An unknown `type` is an
//! error.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::audio::pcm::{decode_pcm16_le, encode_pcm16_le};
use crate::error::{Result, VoxError};

/// One discrete message exchanged over the duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Message(MessageEnvelope),
    Function(FunctionCall),
    FunctionCompletion(FunctionCompletion),
    Agent(AgentStatus),
    Audio(AudioFrame),
    Interrupt(Interrupt),
    Settings(SettingsEnvelope),
    Console(ConsoleEnvelope),
    Error(ErrorEnvelope),
}

/// Discriminant of an [`Envelope`], for logging and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Message,
    Function,
    FunctionCompletion,
    Agent,
    Audio,
    Interrupt,
    Settings,
    Console,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::Function => "function",
            EnvelopeKind::FunctionCompletion => "function_completion",
            EnvelopeKind::Agent => "agent",
            EnvelopeKind::Audio => "audio",
            EnvelopeKind::Interrupt => "interrupt",
            EnvelopeKind::Settings => "settings",
            EnvelopeKind::Console => "console",
            EnvelopeKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Conversational turn text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

/// Tool invocation requested by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub call_id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub arguments: Map<String, Value>,
}

/// The client's answer to a [`FunctionCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCompletion {
    #[serde(default)]
    pub id: String,
    pub call_id: String,
    #[serde(default)]
    pub output: String,
}

/// Status/progress update from a named sub-agent working on a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub id: String,
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub information: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<AgentContent>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub output: bool,
}

impl AgentStatus {
    /// Whether the sub-agent reported a failed run.
    pub fn is_failed(&self) -> bool {
        self.status.to_ascii_lowercase().contains("failed")
    }
}

/// Payload carried by an agent update: a typed block or plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentContent {
    Block(ContentBlock),
    Plain(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default)]
    pub content: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    Video,
    ToolCalls,
    ThreadMessage,
}

impl AgentContent {
    /// Text values carried by this content, in order.
    ///
    /// Plain content yields itself; typed blocks yield the `value` of every
    /// item whose own `type` is `"text"`.
    pub fn text_items(&self) -> Vec<&str> {
        match self {
            AgentContent::Plain(text) => vec![text.as_str()],
            AgentContent::Block(block) => block
                .content
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("value").and_then(Value::as_str))
                .collect(),
        }
    }

    /// Every text or image item, in order. Items of other types are skipped.
    pub fn output_items(&self) -> Vec<OutputItem<'_>> {
        let block = match self {
            AgentContent::Plain(text) => return vec![OutputItem::Text(text)],
            AgentContent::Block(block) => block,
        };
        let field = |item: &Value, key: &str| -> String {
            item.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        block
            .content
            .iter()
            .filter_map(|item| match item.get("type").and_then(Value::as_str)? {
                "text" => item.get("value").and_then(Value::as_str).map(OutputItem::Text),
                "image" => Some(OutputItem::Image {
                    description: field(item, "description"),
                    size: field(item, "size"),
                    quality: field(item, "quality"),
                }),
                _ => None,
            })
            .collect()
    }
}

/// A result item a sub-agent produced for its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputItem<'a> {
    Text(&'a str),
    Image {
        description: String,
        size: String,
        quality: String,
    },
}

/// One frame of PCM16 audio, base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: String,
}

impl AudioFrame {
    /// Encode little-endian PCM16 samples into a frame.
    pub fn from_pcm(samples: &[i16]) -> Self {
        Self::from_bytes(&encode_pcm16_le(samples))
    }

    /// Wrap already-encoded PCM16 little-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            id: generate_id("audio"),
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decode the base64 payload into PCM16 samples.
    ///
    /// # Errors
    /// `VoxError::Codec` on invalid base64 or an odd byte count.
    pub fn decode_pcm(&self) -> Result<Vec<i16>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.content.as_bytes())
            .map_err(|e| VoxError::Codec(format!("audio content is not base64: {e}")))?;
        decode_pcm16_le(&bytes)
    }
}

/// Barge-in: the receiver must flush any buffered playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    #[serde(default)]
    pub id: String,
}

/// Session configuration, sent once at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub settings: Map<String, Value>,
}

/// Free-form diagnostic payload from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Map<String, Value>,
}

/// Backend-reported failure. Passed through to the application untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "content", deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: String,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::Function(_) => EnvelopeKind::Function,
            Envelope::FunctionCompletion(_) => EnvelopeKind::FunctionCompletion,
            Envelope::Agent(_) => EnvelopeKind::Agent,
            Envelope::Audio(_) => EnvelopeKind::Audio,
            Envelope::Interrupt(_) => EnvelopeKind::Interrupt,
            Envelope::Settings(_) => EnvelopeKind::Settings,
            Envelope::Console(_) => EnvelopeKind::Console,
            Envelope::Error(_) => EnvelopeKind::Error,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Envelope::Message(e) => &e.id,
            Envelope::Function(e) => &e.id,
            Envelope::FunctionCompletion(e) => &e.id,
            Envelope::Agent(e) => &e.id,
            Envelope::Audio(e) => &e.id,
            Envelope::Interrupt(e) => &e.id,
            Envelope::Settings(e) => &e.id,
            Envelope::Console(e) => &e.id,
            Envelope::Error(e) => &e.id,
        }
    }

    /// Correlation id of the tool invocation this envelope belongs to, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Envelope::Function(e) => Some(&e.call_id),
            Envelope::FunctionCompletion(e) => Some(&e.call_id),
            Envelope::Agent(e) => Some(&e.call_id),
            _ => None,
        }
    }

    /// Audio and interrupt envelopes are consumed by the session itself and
    /// never reach the application handler.
    pub fn is_intercepted(&self) -> bool {
        matches!(self, Envelope::Audio(_) | Envelope::Interrupt(_))
    }

    /// Serialise to a single JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one JSON text frame.
    ///
    /// # Errors
    /// `VoxError::Codec` for malformed JSON, an unknown `type`, or missing
    /// required fields.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| VoxError::Codec(e.to_string()))
    }

    pub fn user_message(content: impl Into<String>) -> Self {
        Envelope::Message(MessageEnvelope {
            id: generate_id("message"),
            role: Role::User,
            content: content.into(),
        })
    }

    pub fn interrupt() -> Self {
        Envelope::Interrupt(Interrupt {
            id: generate_id("interrupt"),
        })
    }

    pub fn settings(id: impl Into<String>, settings: Map<String, Value>) -> Self {
        Envelope::Settings(SettingsEnvelope {
            id: id.into(),
            settings,
        })
    }

    pub fn function_completion(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Envelope::FunctionCompletion(FunctionCompletion {
            id: generate_id("function_completion"),
            call_id: call_id.into(),
            output: output.into(),
        })
    }

    pub fn audio(samples: &[i16]) -> Self {
        Envelope::Audio(AudioFrame::from_pcm(samples))
    }
}

/// `<kind>_<12 hex chars>`, unique per client-generated envelope.
pub fn generate_id(kind: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{kind}_{}", &uuid[..12])
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_assistant_message() {
        let env = Envelope::decode(
            r#"{"id":"msg_1","type":"message","role":"assistant","content":"hi"}"#,
        )
        .expect("decode message");
        assert_eq!(env.kind(), EnvelopeKind::Message);
        assert_eq!(env.id(), "msg_1");
        match env {
            Envelope::Message(m) => {
                assert_eq!(m.role, Role::Assistant);
                assert_eq!(m.content, "hi");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn decodes_agent_tool_calls_with_null_fields() {
        let raw = json!({
            "id": "step_sSkZ",
            "type": "agent",
            "call_id": "call_XsUL",
            "name": "Event Venue Agent",
            "status": "step \"tool calls\" completed",
            "information": null,
            "content": {
                "type": "tool_calls",
                "content": [{"id": "call_Oh", "type": "file_search", "results": []}]
            },
            "output": null
        });
        let env = Envelope::decode(&raw.to_string()).expect("decode agent");
        assert_eq!(env.call_id(), Some("call_XsUL"));
        let Envelope::Agent(agent) = env else {
            panic!("expected agent envelope");
        };
        assert!(!agent.output);
        assert!(agent.information.is_none());
        match agent.content {
            Some(AgentContent::Block(block)) => {
                assert_eq!(block.kind, ContentKind::ToolCalls);
                assert_eq!(block.content.len(), 1);
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn agent_content_accepts_plain_text() {
        let env = Envelope::decode(
            r#"{"id":"a","type":"agent","call_id":"c","name":"Writer","status":"done","content":"a poem","output":true}"#,
        )
        .expect("decode agent");
        let Envelope::Agent(agent) = env else {
            panic!("expected agent envelope");
        };
        let content = agent.content.expect("content present");
        assert_eq!(content.text_items(), vec!["a poem"]);
    }

    #[test]
    fn text_items_skip_non_text_entries() {
        let content = AgentContent::Block(ContentBlock {
            kind: ContentKind::Text,
            content: vec![
                json!({"type": "text", "value": "first"}),
                json!({"type": "image", "image_url": "images/x.png"}),
                json!({"type": "text", "value": "second"}),
            ],
        });
        assert_eq!(content.text_items(), vec!["first", "second"]);
    }

    #[test]
    fn output_items_keep_text_and_image_order() {
        let content = AgentContent::Block(ContentBlock {
            kind: ContentKind::Image,
            content: vec![
                json!({"type": "image", "image_url": "images/cat.png",
                       "description": "a cat", "size": "1024x1024", "quality": "hd"}),
                json!({"type": "video", "video_url": "v.mp4"}),
                json!({"type": "text", "value": "caption"}),
            ],
        });
        assert_eq!(
            content.output_items(),
            vec![
                OutputItem::Image {
                    description: "a cat".into(),
                    size: "1024x1024".into(),
                    quality: "hd".into(),
                },
                OutputItem::Text("caption"),
            ]
        );
        assert_eq!(content.text_items(), vec!["caption"]);
    }

    #[test]
    fn agent_failure_detection_is_case_insensitive() {
        let agent = AgentStatus {
            id: "s".into(),
            call_id: "c".into(),
            name: "RSVP Agent".into(),
            status: "Run FAILED".into(),
            information: None,
            content: None,
            output: false,
        };
        assert!(agent.is_failed());
    }

    #[test]
    fn bare_interrupt_and_settings_decode_with_defaults() {
        let interrupt = Envelope::decode(r#"{"type":"interrupt"}"#).expect("interrupt");
        assert_eq!(interrupt.kind(), EnvelopeKind::Interrupt);
        assert_eq!(interrupt.id(), "");
        assert!(interrupt.is_intercepted());

        let settings = Envelope::decode(r#"{"type":"settings"}"#).expect("settings");
        match settings {
            Envelope::Settings(s) => assert!(s.settings.is_empty()),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn error_envelope_reads_legacy_content_field() {
        let env = Envelope::decode(
            r#"{"id":"e1","type":"error","error":"RateLimit","content":"slow down"}"#,
        )
        .expect("decode error");
        let Envelope::Error(err) = env else {
            panic!("expected error envelope");
        };
        assert_eq!(err.message, "slow down");
        assert_eq!(err.error, "RateLimit");
    }

    #[test]
    fn unknown_type_is_codec_error() {
        let err = Envelope::decode(r#"{"id":"x","type":"telemetry"}"#).unwrap_err();
        assert!(matches!(err, VoxError::Codec(_)));

        let err = Envelope::decode("not json").unwrap_err();
        assert!(matches!(err, VoxError::Codec(_)));
    }

    #[test]
    fn encode_uses_snake_case_type_tag() {
        let env = Envelope::function_completion("call_1", "done");
        let value: Value = serde_json::from_str(&env.encode().expect("encode")).expect("json");
        assert_eq!(value["type"], "function_completion");
        assert_eq!(value["call_id"], "call_1");
        assert_eq!(value["output"], "done");
        assert!(value["id"]
            .as_str()
            .expect("id is a string")
            .starts_with("function_completion_"));
    }

    #[test]
    fn agent_encode_omits_absent_optionals() {
        let env = Envelope::Agent(AgentStatus {
            id: "s".into(),
            call_id: "c".into(),
            name: "n".into(),
            status: "run in progress".into(),
            information: None,
            content: None,
            output: false,
        });
        let value: Value = serde_json::from_str(&env.encode().expect("encode")).expect("json");
        assert!(value.get("information").is_none());
        assert!(value.get("content").is_none());
        assert_eq!(value["output"], false);
    }

    #[test]
    fn audio_frame_carries_little_endian_pcm() {
        let frame = AudioFrame::from_pcm(&[1, -2, i16::MAX]);
        assert_eq!(frame.content, "AQD+//9/");
        assert_eq!(frame.decode_pcm().expect("decode"), vec![1, -2, i16::MAX]);
    }

    #[test]
    fn audio_frame_rejects_odd_byte_count_and_bad_base64() {
        let odd = AudioFrame {
            id: "a".into(),
            content: base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]),
        };
        assert!(matches!(odd.decode_pcm(), Err(VoxError::Codec(_))));

        let garbage = AudioFrame {
            id: "a".into(),
            content: "***".into(),
        };
        assert!(matches!(garbage.decode_pcm(), Err(VoxError::Codec(_))));
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = generate_id("audio");
        let b = generate_id("audio");
        assert!(a.starts_with("audio_"));
        assert_eq!(a.len(), "audio_".len() + 12);
        assert_ne!(a, b);
    }
}
