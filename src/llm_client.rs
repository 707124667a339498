//! LLM Client Facade: the single boundary at which provider identity is
//! visible. The Agent Engine only ever sees normalized `StreamChunk`s
//! (spec §4.2).

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use std::time::Duration;

use crate::error::AgentError;
use crate::model::{Message, Role, StreamChunk, ToolDescriptor};
use crate::retry::{is_retryable_status, BackoffPolicy};
use crate::stream::anthropic::AnthropicStreamProcessor;
use crate::stream::openai::OpenAiStreamProcessor;
use crate::stream::drain_sse_events;

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAiStyle,
    AnthropicStyle,
}

impl ProviderKind {
    /// Infers the provider kind from the endpoint host, per spec §4.2/§6
    /// ("Provider selection is by endpoint host; configuration MAY
    /// override").
    pub fn from_endpoint(endpoint: &str) -> Self {
        if endpoint.contains("anthropic.com") {
            ProviderKind::AnthropicStyle
        } else {
            ProviderKind::OpenAiStyle
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Uniform `chat(messages, tools) -> AsyncSequence<StreamChunk>` facade.
/// Mirrors the teacher's `ClientWrapper` trait-object shape, generalized
/// from single-shot/stream response pairs to a single streaming method.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ChunkStream, AgentError>;
}

/// Default facade implementation driving either wire format over HTTP.
pub struct LlmClientFacade {
    config: ProviderConfig,
    http: reqwest::Client,
    backoff: BackoffPolicy,
}

impl LlmClientFacade {
    pub fn new(config: ProviderConfig) -> Self {
        let http = crate::http_pool::get_or_create_client(&config.endpoint);
        Self {
            config,
            http,
            backoff: BackoffPolicy::default(),
        }
    }

    fn build_request_body(&self, messages: &[Message], tools: &[ToolDescriptor]) -> serde_json::Value {
        match self.config.kind {
            ProviderKind::OpenAiStyle => {
                let msgs: Vec<_> = messages
                    .iter()
                    .map(|m| serde_json::json!({ "role": role_str(m.role), "content": &m.content }))
                    .collect();
                serde_json::json!({
                    "model": self.config.model,
                    "messages": msgs,
                    "tools": tool_descriptors_to_openai(tools),
                    "max_tokens": self.config.max_tokens,
                    "temperature": self.config.temperature,
                    "stream": true,
                })
            }
            ProviderKind::AnthropicStyle => {
                let system = messages
                    .iter()
                    .find(|m| matches!(m.role, Role::System))
                    .map(|m| match &m.content {
                        crate::model::Content::Text(t) => t.clone(),
                        _ => String::new(),
                    })
                    .unwrap_or_default();
                let msgs: Vec<_> = messages
                    .iter()
                    .filter(|m| !matches!(m.role, Role::System))
                    .map(|m| serde_json::json!({ "role": role_str(m.role), "content": &m.content }))
                    .collect();
                serde_json::json!({
                    "model": self.config.model,
                    "system": system,
                    "messages": msgs,
                    "tools": tool_descriptors_to_anthropic(tools),
                    "max_tokens": self.config.max_tokens,
                    "stream": true,
                })
            }
        }
    }

    async fn post_with_retry(&self, body: serde_json::Value) -> Result<reqwest::Response, AgentError> {
        let mut attempt = 0u32;
        loop {
            let mut request = self.http.post(&self.config.endpoint).json(&body);
            request = match self.config.kind {
                ProviderKind::OpenAiStyle => {
                    request.bearer_auth(&self.config.api_key)
                }
                ProviderKind::AnthropicStyle => request
                    .header("x-api-key", &self.config.api_key)
                    .header("anthropic-version", "2023-06-01"),
            };

            let result = request.send().await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 401 || status == 403 {
                        return Err(AgentError::auth_failed(format!(
                            "provider returned HTTP {status}"
                        )));
                    }
                    if !is_retryable_status(status) || attempt + 1 >= self.backoff.max_attempts {
                        return Err(if status == 429 {
                            AgentError::rate_limited(format!("provider returned HTTP {status}"))
                        } else {
                            AgentError::server_error(format!("provider returned HTTP {status}"))
                        });
                    }
                }
                Err(e) => {
                    if attempt + 1 >= self.backoff.max_attempts {
                        return Err(AgentError::network_error(e.to_string()));
                    }
                }
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ClientWrapper for LlmClientFacade {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ChunkStream, AgentError> {
        let body = self.build_request_body(messages, tools);
        let response = self.post_with_retry(body).await?;
        let kind = self.config.kind;

        let byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut openai_processor = OpenAiStreamProcessor::new();
        let mut anthropic_processor = AnthropicStreamProcessor::new();

        let chunk_stream = byte_stream.flat_map(move |item| {
            let mut out = Vec::new();
            match item {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for event in drain_sse_events(&mut buffer) {
                        let mut chunks = match kind {
                            ProviderKind::OpenAiStyle => openai_processor.process_event(&event.data),
                            ProviderKind::AnthropicStyle => {
                                anthropic_processor.process_event(&event.data)
                            }
                        };
                        out.append(&mut chunks);
                    }
                }
                Err(e) => out.push(StreamChunk::Error {
                    message: e.to_string(),
                }),
            }
            futures_util::stream::iter(out)
        });

        Ok(Box::pin(chunk_stream))
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn tool_descriptors_to_openai(tools: &[ToolDescriptor]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

fn tool_descriptors_to_anthropic(tools: &[ToolDescriptor]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect()
}

/// Unused in non-test builds but kept near the retry loop it documents:
/// connect timeout default per spec §5.
#[allow(dead_code)]
pub const LLM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_inferred_from_host() {
        assert_eq!(
            ProviderKind::from_endpoint("https://api.anthropic.com/v1/messages"),
            ProviderKind::AnthropicStyle
        );
        assert_eq!(
            ProviderKind::from_endpoint("https://api.openai.com/v1/chat/completions"),
            ProviderKind::OpenAiStyle
        );
    }
}
