//! Anthropic-style stream adapter: typed SSE events (`message_start`,
//! `content_block_start/delta/stop`, `message_delta`, `message_stop`,
//! `ping`, `error`). Grounded on the event sequence and per-index
//! tool-argument accumulation pattern used by comparable Anthropic
//! streaming clients elsewhere in the ecosystem, since this crate owns
//! the parsing directly rather than delegating to a provider SDK.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{StreamChunk, TokenUsage};
use crate::stream::sanitize_token_text;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        #[allow(dead_code)]
        message: MessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaData,
        usage: AnthropicUsage,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicStreamError,
    },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockStart {
    Text {
        #[serde(default)]
        #[allow(dead_code)]
        text: String,
    },
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
}

#[derive(Debug, Deserialize, Default)]
struct MessageDeltaData {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamError {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    error_type: String,
    message: String,
}

#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Per-stream state machine, keyed by content-block `index`, tracking
/// in-flight tool_use blocks and the final stop reason (spec §9).
#[derive(Default)]
pub struct AnthropicStreamProcessor {
    tool_calls: HashMap<u32, ToolCallBuilder>,
    usage: TokenUsage,
    pending_stop_reason: Option<String>,
}

impl AnthropicStreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one event's JSON `data:` body and return zero or more
    /// normalized chunks.
    pub fn process_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let event: AnthropicEvent = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        match event {
            AnthropicEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.usage.input_tokens = usage.input_tokens;
                }
                Vec::new()
            }

            AnthropicEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlockStart::ToolUse { id, name } => {
                    self.tool_calls.insert(
                        index,
                        ToolCallBuilder {
                            id: Some(id.clone()),
                            name: Some(name.clone()),
                            arguments: String::new(),
                        },
                    );
                    vec![StreamChunk::ToolCallBegin { id, name }]
                }
                ContentBlockStart::Text { .. } => Vec::new(),
            },

            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![StreamChunk::Token {
                    text: sanitize_token_text(&text),
                }],
                BlockDelta::ThinkingDelta { thinking } => vec![StreamChunk::Thinking {
                    text: sanitize_token_text(&thinking),
                }],
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(builder) = self.tool_calls.get_mut(&index) {
                        builder.arguments.push_str(&partial_json);
                        vec![StreamChunk::ToolCallArgsDelta {
                            id: builder.id.clone().unwrap_or_default(),
                            fragment: partial_json,
                        }]
                    } else {
                        Vec::new()
                    }
                }
            },

            AnthropicEvent::ContentBlockStop { index } => {
                let Some(builder) = self.tool_calls.remove(&index) else {
                    return Vec::new();
                };
                let Some(name) = builder.name else {
                    return Vec::new();
                };
                let arguments = if builder.arguments.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str::<Value>(&builder.arguments).unwrap_or_else(|_| {
                        serde_json::json!({ "_parseError": true, "_raw": builder.arguments })
                    })
                };
                vec![StreamChunk::ToolCallEnd {
                    id: builder.id.unwrap_or_default(),
                    name,
                    arguments,
                }]
            }

            AnthropicEvent::MessageDelta { delta, usage } => {
                self.usage.output_tokens = usage.output_tokens;
                self.usage.total_tokens = self.usage.input_tokens + self.usage.output_tokens;
                self.pending_stop_reason = delta.stop_reason;
                vec![StreamChunk::Usage {
                    usage: self.usage.clone(),
                }]
            }

            AnthropicEvent::MessageStop => vec![StreamChunk::Done {
                stop_reason: self
                    .pending_stop_reason
                    .clone()
                    .unwrap_or_else(|| "end_turn".to_string()),
            }],

            AnthropicEvent::Ping => Vec::new(),

            AnthropicEvent::Error { error } => vec![StreamChunk::Error {
                message: error.message,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_becomes_token() {
        let mut p = AnthropicStreamProcessor::new();
        let chunks = p.process_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert!(matches!(&chunks[0], StreamChunk::Token { text } if text == "Hi"));
    }

    #[test]
    fn thinking_delta_is_surfaced_as_thinking_not_token() {
        let mut p = AnthropicStreamProcessor::new();
        let chunks = p.process_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"pondering"}}"#,
        );
        assert!(matches!(&chunks[0], StreamChunk::Thinking { text } if text == "pondering"));
    }

    #[test]
    fn tool_use_block_accumulates_and_finalizes_on_stop() {
        let mut p = AnthropicStreamProcessor::new();
        p.process_event(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"read_file"}}"#,
        );
        p.process_event(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"/tmp/a\"}"}}"#,
        );
        let chunks = p.process_event(r#"{"type":"content_block_stop","index":1}"#);
        let end = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::ToolCallEnd { id, name, arguments } => Some((id, name, arguments)),
                _ => None,
            })
            .expect("expected tool-call-end on content_block_stop");
        assert_eq!(end.0, "toolu_1");
        assert_eq!(end.1, "read_file");
        assert_eq!(end.2["path"], "/tmp/a");
    }

    #[test]
    fn unparseable_tool_args_on_stop_yield_parse_error_marker() {
        let mut p = AnthropicStreamProcessor::new();
        p.process_event(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_2","name":"read_file"}}"#,
        );
        p.process_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
        );
        let chunks = p.process_event(r#"{"type":"content_block_stop","index":0}"#);
        let arguments = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::ToolCallEnd { arguments, .. } => Some(arguments),
                _ => None,
            })
            .unwrap();
        assert_eq!(arguments["_parseError"], true);
    }

    #[test]
    fn message_stop_emits_done_with_preceding_stop_reason() {
        let mut p = AnthropicStreamProcessor::new();
        p.process_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
        );
        let chunks = p.process_event(r#"{"type":"message_stop"}"#);
        assert!(matches!(&chunks[0], StreamChunk::Done { stop_reason } if stop_reason == "end_turn"));
    }

    #[test]
    fn error_event_surfaces_as_error_chunk() {
        let mut p = AnthropicStreamProcessor::new();
        let chunks = p.process_event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"servers overloaded"}}"#,
        );
        assert!(matches!(&chunks[0], StreamChunk::Error { message } if message == "servers overloaded"));
    }

    #[test]
    fn ping_is_ignored() {
        let mut p = AnthropicStreamProcessor::new();
        let chunks = p.process_event(r#"{"type":"ping"}"#);
        assert!(chunks.is_empty());
    }
}
