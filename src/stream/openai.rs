//! OpenAI-style stream adapter: server-sent events where each event body
//! is `{choices:[{delta:{content?, tool_calls?[...]}, finish_reason?}],
//! usage?}`, terminated by the literal `data: [DONE]` (spec §4.1).

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{StreamChunk, TokenUsage};
use crate::stream::sanitize_token_text;

#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct DeltaToolCallFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaToolCallFunction>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    /// Provider chain-of-thought output. Discarded per spec §4.1: never
    /// surfaced as a token.
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize, Default)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

/// Per-stream state machine accumulating incremental tool-call argument
/// fragments, keyed by `index` — an explicit state type rather than
/// ad-hoc string buffers scattered through the adapter (spec §9).
#[derive(Default)]
pub struct OpenAiStreamProcessor {
    tool_calls: HashMap<u32, ToolCallBuilder>,
}

impl OpenAiStreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one `data:` event body (without the `data: ` prefix) and
    /// return zero or more normalized chunks, in emission order.
    pub fn process_event(&mut self, data: &str) -> Vec<StreamChunk> {
        if data.trim() == "[DONE]" {
            return vec![StreamChunk::Done {
                stop_reason: "stop".to_string(),
            }];
        }

        let parsed: OpenAiChunk = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::new();

        if let Some(usage) = parsed.usage {
            out.push(StreamChunk::Usage {
                usage: TokenUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                },
            });
        }

        for choice in parsed.choices {
            // Chain-of-thought must never leak into transcript/UI.
            let _ = choice.delta.reasoning_content;

            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    out.push(StreamChunk::Token {
                        text: sanitize_token_text(&text),
                    });
                }
            }

            if let Some(tool_calls) = choice.delta.tool_calls {
                for tc in tool_calls {
                    let entry = self.tool_calls.entry(tc.index).or_default();
                    if let Some(id) = tc.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(fragment) = function.arguments {
                            entry.arguments.push_str(&fragment);
                            out.push(StreamChunk::ToolCallArgsDelta {
                                id: entry.id.clone().unwrap_or_default(),
                                fragment,
                            });
                        }
                    }

                    if let Some(name) = entry.name.clone() {
                        if let Ok(arguments) = serde_json::from_str::<Value>(&entry.arguments) {
                            out.push(StreamChunk::ToolCallEnd {
                                id: entry.id.clone().unwrap_or_default(),
                                name,
                                arguments,
                            });
                            self.tool_calls.remove(&tc.index);
                        }
                    }
                }
            }

            if let Some(finish_reason) = choice.finish_reason {
                out.extend(self.finalize_remaining());
                out.push(StreamChunk::Done {
                    stop_reason: finish_reason,
                });
            }
        }

        out
    }

    /// Flush every tool call whose name is known but whose argument
    /// buffer never parsed as valid JSON before `finish_reason` arrived.
    /// Emits a parse-error marker instead of silently dropping the call,
    /// so the Engine can surface it as a failed tool result (spec §4.1).
    fn finalize_remaining(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        for (_, builder) in self.tool_calls.drain() {
            let Some(name) = builder.name else { continue };
            let arguments = serde_json::from_str::<Value>(&builder.arguments).unwrap_or_else(|_| {
                serde_json::json!({ "_parseError": true, "_raw": builder.arguments })
            });
            out.push(StreamChunk::ToolCallEnd {
                id: builder.id.unwrap_or_default(),
                name,
                arguments,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_becomes_sanitized_token() {
        let mut p = OpenAiStreamProcessor::new();
        let chunks = p.process_event(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#);
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], StreamChunk::Token { text } if text == "Hi"));
    }

    #[test]
    fn reasoning_content_is_never_surfaced_as_token() {
        let mut p = OpenAiStreamProcessor::new();
        let chunks = p.process_event(
            r#"{"choices":[{"delta":{"reasoning_content":"let me think"}}]}"#,
        );
        assert!(chunks.iter().all(|c| !matches!(c, StreamChunk::Token { .. })));
    }

    #[test]
    fn tool_call_accumulates_across_events_and_finalizes_on_valid_json() {
        let mut p = OpenAiStreamProcessor::new();
        let mut chunks = p.process_event(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read_file","arguments":"{\"path\":"}}]}}]}"#,
        );
        assert!(!chunks.iter().any(|c| matches!(c, StreamChunk::ToolCallEnd { .. })));
        chunks.extend(p.process_event(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"/tmp/a\"}"}}]}}]}"#,
        ));
        let end = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::ToolCallEnd { id, name, arguments } => Some((id, name, arguments)),
                _ => None,
            })
            .expect("expected a tool-call-end chunk");
        assert_eq!(end.0, "call_1");
        assert_eq!(end.1, "read_file");
        assert_eq!(end.2["path"], "/tmp/a");
    }

    #[test]
    fn unterminated_json_on_finish_reason_yields_parse_error_marker() {
        let mut p = OpenAiStreamProcessor::new();
        p.process_event(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_2","function":{"name":"read_file","arguments":"{\"path\":\"/tmp"}}]}}]}"#,
        );
        let chunks = p.process_event(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let end = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::ToolCallEnd { arguments, .. } => Some(arguments),
                _ => None,
            })
            .expect("expected finalize-on-finish_reason to emit a tool-call-end");
        assert_eq!(end["_parseError"], true);
    }

    #[test]
    fn done_sentinel_is_recognized() {
        let mut p = OpenAiStreamProcessor::new();
        let chunks = p.process_event("[DONE]");
        assert!(matches!(chunks[0], StreamChunk::Done { .. }));
    }
}
