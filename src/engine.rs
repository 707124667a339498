//! Agent Engine: the streaming, multi-turn orchestrator (spec §4.6).
//! Grounded on the teacher's `Agent` constructor-injection shape and
//! `EventHandler`-style callback trait (`agent.rs`, `event.rs`),
//! generalized from the teacher's single-iteration tool loop to the
//! spec's sequential-dispatch, permission-gated turn loop.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::AgentError;
use crate::llm_client::ClientWrapper;
use crate::mcp::McpClientManager;
use crate::model::{
    Content, ContentBlock, Message, PermissionDecision, PermissionScope, Session, StreamChunk,
    TokenUsage, ToolCallRecord, ToolCallStatus,
};
use crate::permission::{PermissionManager, RiskLevel};
use crate::session::SessionStore;

pub const DEFAULT_MAX_TURNS: usize = 10;

pub type StringStream = std::pin::Pin<Box<dyn futures_util::stream::Stream<Item = String> + Send>>;

/// Cheap `Clone`able cancellation signal honored at every suspension
/// point in the turn loop (spec §5).
#[derive(Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Consumed, not implemented, by the core (spec §6): the UI collaborator
/// that resolves an `ask` decision. Returning `None` is treated as a
/// decline/timeout, which the Engine folds into `deny`.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn prompt(
        &self,
        tool_name: &str,
        risk: RiskLevel,
        arguments: &Value,
    ) -> Option<(PermissionDecision, PermissionScope)>;
}

/// A `PermissionPrompt` that always declines — useful as a safe default
/// when no interactive collaborator is wired up.
pub struct AlwaysDenyPrompt;

#[async_trait]
impl PermissionPrompt for AlwaysDenyPrompt {
    async fn prompt(&self, _tool_name: &str, _risk: RiskLevel, _arguments: &Value) -> Option<(PermissionDecision, PermissionScope)> {
        None
    }
}

/// Optional observability callbacks (spec §4.6's `callbacks?` parameter).
/// Every method has a no-op default, mirroring the teacher's
/// `EventHandler` trait (`event.rs`) so callers only override what they
/// care about.
#[async_trait]
pub trait EngineCallbacks: Send + Sync {
    async fn on_chunk(&self, _text: &str) {}
    async fn on_tool_start(&self, _record: &ToolCallRecord) {}
    async fn on_tool_complete(&self, _record: &ToolCallRecord) {}
    async fn on_error(&self, _error: &AgentError) {}
    async fn on_done(&self) {}
}

pub struct NoopCallbacks;

#[async_trait]
impl EngineCallbacks for NoopCallbacks {}

/// Drives one conversation. Not reentrant: calling `send_message` while a
/// previous call has not completed is a contract violation (spec §5).
pub struct AgentEngine {
    llm_client: Arc<dyn ClientWrapper>,
    mcp_manager: Arc<McpClientManager>,
    permission_manager: Arc<PermissionManager>,
    session_store: Arc<SessionStore>,
    permission_prompt: Arc<dyn PermissionPrompt>,
    max_turns: usize,
    session: Mutex<Session>,
}

impl AgentEngine {
    pub fn new(
        llm_client: Arc<dyn ClientWrapper>,
        mcp_manager: Arc<McpClientManager>,
        permission_manager: Arc<PermissionManager>,
        session_store: Arc<SessionStore>,
        permission_prompt: Arc<dyn PermissionPrompt>,
        session: Session,
    ) -> Self {
        Self {
            llm_client,
            mcp_manager,
            permission_manager,
            session_store,
            permission_prompt,
            max_turns: DEFAULT_MAX_TURNS,
            session: Mutex::new(session),
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub async fn session_id(&self) -> String {
        self.session.lock().await.id.clone()
    }

    /// `sendMessage(text, callbacks?) -> AsyncSequence<string>` (spec
    /// §4.6). Tokens are yielded on the returned stream in emission
    /// order as they arrive; the turn loop runs on a background task so
    /// the caller can drive the stream at its own pace.
    pub async fn send_message(
        self: Arc<Self>,
        text: impl Into<String>,
        callbacks: Arc<dyn EngineCallbacks>,
        cancel: CancellationFlag,
    ) -> StringStream {
        let text = text.into();
        let (tx, rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            if let Err(e) = self.run_turn_loop(text, &tx, &callbacks, &cancel).await {
                callbacks.on_error(&e).await;
            }
            callbacks.on_done().await;
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    async fn run_turn_loop(
        &self,
        text: String,
        tx: &mpsc::UnboundedSender<String>,
        callbacks: &Arc<dyn EngineCallbacks>,
        cancel: &CancellationFlag,
    ) -> Result<(), AgentError> {
        let mut session = self.session.lock().await;

        session.messages.push(Message::user(text));
        session.touch();
        self.session_store.save(&session).await?;

        let mut turn = 0usize;
        let mut done = false;

        while !done && turn < self.max_turns {
            if cancel.is_cancelled() {
                return Ok(());
            }
            turn += 1;

            let descriptors = self.mcp_manager.list_tools().await;
            let mut stream = self.llm_client.chat(&session.messages, &descriptors).await?;

            let mut text_accum = String::new();
            let mut pending_calls: Vec<(String, String, Value)> = Vec::new();
            let mut usage = TokenUsage::default();
            let mut turn_error: Option<AgentError> = None;

            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    drop(stream);
                    return Ok(());
                }
                match chunk {
                    StreamChunk::Token { text } => {
                        let _ = tx.send(text.clone());
                        callbacks.on_chunk(&text).await;
                        text_accum.push_str(&text);
                    }
                    // Discarded from yielded output and from persisted
                    // history: provider chain-of-thought must never leak
                    // into the transcript or UI (spec §9).
                    StreamChunk::Thinking { .. } => {}
                    StreamChunk::ToolCallEnd { id, name, arguments } => {
                        pending_calls.push((id, name, arguments));
                    }
                    StreamChunk::Usage { usage: delta } => usage.accumulate(&delta),
                    StreamChunk::Done { .. } => break,
                    StreamChunk::Error { message } => {
                        turn_error = Some(AgentError::stream_error(message));
                        break;
                    }
                    StreamChunk::ToolCallBegin { .. } | StreamChunk::ToolCallArgsDelta { .. } => {}
                }
            }
            drop(stream);

            if let Some(e) = turn_error {
                callbacks.on_error(&e).await;
                return Err(e);
            }

            log::debug!("turn {turn} usage: {usage:?}");

            // Assistant content: a text block plus one tool_use block per
            // pending call, preserving emission order (spec §4.6 step 3).
            let mut blocks = vec![ContentBlock::Text { text: text_accum }];
            for (id, name, arguments) in &pending_calls {
                blocks.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
            }
            session.messages.push(Message::assistant(Content::Blocks(blocks)));
            session.touch();
            self.session_store.save(&session).await?;

            if pending_calls.is_empty() {
                done = true;
                break;
            }

            // Sequential dispatch in emission order (spec §4.6/§5
            // determinism guarantee).
            for (id, name, arguments) in pending_calls {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                self.dispatch_tool_call(&mut session, id, name, arguments, callbacks).await?;
            }
        }

        Ok(())
    }

    async fn dispatch_tool_call(
        &self,
        session: &mut Session,
        id: String,
        name: String,
        arguments: Value,
        callbacks: &Arc<dyn EngineCallbacks>,
    ) -> Result<(), AgentError> {
        let mut record = ToolCallRecord::new(id.clone(), name.clone(), arguments.clone());

        let decision = match self.permission_manager.check(&name, &arguments).await {
            PermissionDecision::Ask => {
                let risk = self.permission_manager.classify_risk(&name, &arguments);
                match self.permission_prompt.prompt(&name, risk, &arguments).await {
                    Some((decision, scope)) => {
                        self.permission_manager.record(&name, decision, scope).await;
                        decision
                    }
                    // Collaborator declined or timed out: treat as deny
                    // (spec §4.6 step 5).
                    None => PermissionDecision::Deny,
                }
            }
            other => other,
        };

        match decision {
            PermissionDecision::Deny => {
                record.status = ToolCallStatus::Denied;
                session
                    .messages
                    .push(Message::tool_result(id, "Error: permission denied", true));
            }
            PermissionDecision::Allow => {
                record.status = ToolCallStatus::Running;
                record.started_at = Some(Utc::now());
                callbacks.on_tool_start(&record).await;

                match self.mcp_manager.call_tool(&name, arguments).await {
                    Ok(output) => {
                        record.status = ToolCallStatus::Completed;
                        record.ended_at = Some(Utc::now());
                        record.output = Some(output.clone());
                        session.messages.push(Message::tool_result(id, output, false));
                    }
                    Err(e) => {
                        // Tool execution failures do not end the
                        // conversation; the model sees the failure text
                        // and decides how to proceed (spec §4.6/§7).
                        record.status = ToolCallStatus::Failed;
                        record.ended_at = Some(Utc::now());
                        record.error = Some(e.to_string());
                        session.messages.push(Message::tool_result(id, e.to_string(), true));
                    }
                }
                callbacks.on_tool_complete(&record).await;
            }
            PermissionDecision::Ask => unreachable!("ask is resolved to allow/deny above"),
        }

        session.touch();
        self.session_store.save(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, ToolDescriptor};
    use crate::permission::PermissionManager;
    use std::sync::Mutex as StdMutex;

    struct ScriptedClient {
        turns: StdMutex<Vec<Vec<StreamChunk>>>,
    }

    #[async_trait]
    impl ClientWrapper for ScriptedClient {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDescriptor],
        ) -> Result<crate::llm_client::ChunkStream, AgentError> {
            let chunks = self.turns.lock().unwrap().remove(0);
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
    }

    struct RecordingCallbacks {
        chunks: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EngineCallbacks for RecordingCallbacks {
        async fn on_chunk(&self, text: &str) {
            self.chunks.lock().unwrap().push(text.to_string());
        }
    }

    async fn drain(mut stream: StringStream) -> String {
        let mut out = String::new();
        while let Some(t) = stream.next().await {
            out.push_str(&t);
        }
        out
    }

    #[tokio::test]
    async fn plain_echo_turn_yields_tokens_and_appends_one_assistant_message() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient {
            turns: StdMutex::new(vec![vec![
                StreamChunk::Token { text: "H".into() },
                StreamChunk::Token { text: "i".into() },
                StreamChunk::Done { stop_reason: "end_turn".into() },
            ]]),
        });
        let mcp = Arc::new(McpClientManager::new());
        let permissions = Arc::new(PermissionManager::load(dir.path().to_str().unwrap()).await);
        let sessions = Arc::new(SessionStore::for_workspace(dir.path()));
        let session = sessions.create("/tmp/ws", None).await.unwrap();
        let session_id = session.id.clone();

        let engine = Arc::new(AgentEngine::new(
            client,
            mcp,
            permissions,
            sessions.clone(),
            Arc::new(AlwaysDenyPrompt),
            session,
        ));

        let callbacks = Arc::new(RecordingCallbacks { chunks: StdMutex::new(Vec::new()) });
        let stream = engine
            .clone()
            .send_message("say hi", callbacks.clone(), CancellationFlag::new())
            .await;
        let yielded = drain(stream).await;
        assert_eq!(yielded, "Hi");

        // Give the background task a moment to finish persisting.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let reloaded = sessions.load(&session_id).await.unwrap();
        assert_eq!(reloaded.messages.len(), 2);
        assert!(matches!(reloaded.messages[0].role, Role::User));
        assert!(matches!(reloaded.messages[1].role, Role::Assistant));
    }

    #[tokio::test]
    async fn thinking_chunks_never_reach_the_caller_or_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient {
            turns: StdMutex::new(vec![vec![
                StreamChunk::Thinking { text: "reasoning the model should not expose".into() },
                StreamChunk::Token { text: "Hi".into() },
                StreamChunk::Done { stop_reason: "end_turn".into() },
            ]]),
        });
        let mcp = Arc::new(McpClientManager::new());
        let permissions = Arc::new(PermissionManager::load(dir.path().to_str().unwrap()).await);
        let sessions = Arc::new(SessionStore::for_workspace(dir.path()));
        let session = sessions.create("/tmp/ws", None).await.unwrap();
        let session_id = session.id.clone();

        let engine = Arc::new(AgentEngine::new(
            client,
            mcp,
            permissions,
            sessions.clone(),
            Arc::new(AlwaysDenyPrompt),
            session,
        ));

        let stream = engine
            .clone()
            .send_message("say hi", Arc::new(NoopCallbacks), CancellationFlag::new())
            .await;
        let yielded = drain(stream).await;
        assert_eq!(yielded, "Hi");
        assert!(!yielded.contains("reasoning"));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let reloaded = sessions.load(&session_id).await.unwrap();
        let assistant_text = reloaded
            .messages
            .iter()
            .find_map(|m| match &m.content {
                Content::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                }),
                _ => None,
            })
            .expect("expected a text block in the assistant message");
        assert!(!assistant_text.contains("reasoning"));
    }

    #[tokio::test]
    async fn denied_tool_call_never_reaches_mcp_manager() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient {
            turns: StdMutex::new(vec![vec![
                StreamChunk::ToolCallEnd {
                    id: "t1".into(),
                    name: "execute_command".into(),
                    arguments: serde_json::json!({"cmd": "rm -rf /"}),
                },
                StreamChunk::Done { stop_reason: "tool_calls".into() },
            ]]),
        });
        let mcp = Arc::new(McpClientManager::new());
        let permissions = Arc::new(PermissionManager::load(dir.path().to_str().unwrap()).await);
        let sessions = Arc::new(SessionStore::for_workspace(dir.path()));
        let session = sessions.create("/tmp/ws", None).await.unwrap();
        let session_id = session.id.clone();

        let engine = Arc::new(AgentEngine::new(
            client,
            mcp.clone(),
            permissions,
            sessions.clone(),
            Arc::new(AlwaysDenyPrompt),
            session,
        ));

        let callbacks = Arc::new(NoopCallbacks);
        let stream = engine
            .clone()
            .send_message("do it", callbacks, CancellationFlag::new())
            .await;
        let _ = drain(stream).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let reloaded = sessions.load(&session_id).await.unwrap();
        let tool_result = reloaded
            .messages
            .iter()
            .find_map(|m| match &m.content {
                Content::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                    ContentBlock::ToolResult { content, .. } => Some(content.clone()),
                    _ => None,
                }),
                _ => None,
            })
            .expect("expected a tool_result block");
        assert!(tool_result.contains("permission denied"));
        assert!(mcp.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_stream_stops_short_without_persisting_assistant_turn() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient {
            turns: StdMutex::new(vec![vec![
                StreamChunk::Token { text: "never seen".into() },
                StreamChunk::Done { stop_reason: "end_turn".into() },
            ]]),
        });
        let mcp = Arc::new(McpClientManager::new());
        let permissions = Arc::new(PermissionManager::load(dir.path().to_str().unwrap()).await);
        let sessions = Arc::new(SessionStore::for_workspace(dir.path()));
        let session = sessions.create("/tmp/ws", None).await.unwrap();
        let session_id = session.id.clone();

        let engine = Arc::new(AgentEngine::new(
            client,
            mcp,
            permissions,
            sessions.clone(),
            Arc::new(AlwaysDenyPrompt),
            session,
        ));

        let cancel = CancellationFlag::new();
        cancel.cancel();
        let stream = engine.clone().send_message("hi", Arc::new(NoopCallbacks), cancel).await;
        let yielded = drain(stream).await;
        assert_eq!(yielded, "");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let reloaded = sessions.load(&session_id).await.unwrap();
        // The user message was appended before the cancellation check at
        // the top of the loop, but no assistant turn was persisted.
        assert_eq!(reloaded.messages.len(), 1);
    }
}
