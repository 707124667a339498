//! Core data model shared by every component: messages, sessions, tool
//! descriptors/records, server connections, permission rules, and the
//! normalized stream chunk emitted by the LLM Client Facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One block of assistant/tool message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// A message's content: either plain text or an ordered sequence of blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    /// Every `tool_use` block in this content, if any.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        match self {
            Content::Blocks(blocks) => blocks
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .collect(),
            Content::Text(_) => Vec::new(),
        }
    }

    /// True if every `tool_use` block has a matching `tool_result` block
    /// by id within the same content sequence (used for the history
    /// invariant when both live in one synthesized message).
    pub fn tool_uses_are_answered(&self) -> bool {
        match self {
            Content::Blocks(blocks) => {
                let answered: std::collections::HashSet<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            Some(tool_use_id.as_str())
                        }
                        _ => None,
                    })
                    .collect();
                blocks.iter().all(|b| match b {
                    ContentBlock::ToolUse { id, .. } => answered.contains(id.as_str()),
                    _ => true,
                })
            }
            Content::Text(_) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Content::text(text),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::text(text),
        }
    }

    pub fn assistant(content: Content) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: Content::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error: if is_error { Some(true) } else { None },
            }]),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: Option<String>,
    pub working_directory: String,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(working_directory: impl Into<String>, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            title,
            working_directory: working_directory.into(),
            messages: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A tool's metadata as surfaced to the model, carrying the id of the
/// client connection that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub owning_client_id: String,
}

impl ToolDescriptor {
    /// Stable, provider-qualified alternative to the bare `name`, for
    /// callers that want collision-proof addressing (see DESIGN.md's
    /// Open Question decision on tool-name collisions).
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.owning_client_id, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Approved,
    Denied,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    WebsocketClient,
    WebsocketServer,
}

#[derive(Debug, Clone)]
pub struct ServerConnection {
    pub id: String,
    pub transport_kind: TransportKind,
    pub status: ConnectionStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tool_count: usize,
    pub reconnect_attempt_count: u32,
}

impl ServerConnection {
    pub fn new(id: impl Into<String>, transport_kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            transport_kind,
            status: ConnectionStatus::Connecting,
            last_connected_at: None,
            last_error: None,
            tool_count: 0,
            reconnect_attempt_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    Once,
    Session,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub tool_name_or_pattern: String,
    pub decision: PermissionDecision,
    pub scope: PermissionScope,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionRule {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// On-disk shape of `<workspace>/.floyd/permissions.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsFile {
    pub version: u32,
    pub decisions: HashMap<String, PermissionRule>,
    pub remember_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for PermissionsFile {
    fn default() -> Self {
        Self {
            version: 1,
            decisions: HashMap::new(),
            remember_until: None,
            updated_at: Utc::now(),
        }
    }
}

/// Normalized tagged event emitted by the LLM Client Facade, produced by a
/// Stream Adapter from a provider's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Token { text: String },
    Thinking { text: String },
    ToolCallBegin { id: String, name: String },
    ToolCallArgsDelta { id: String, fragment: String },
    ToolCallEnd { id: String, name: String, arguments: serde_json::Value },
    Usage { usage: TokenUsage },
    Done { stop_reason: String },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_uses_are_answered_detects_unanswered_tool_use() {
        let content = Content::Blocks(vec![ContentBlock::ToolUse {
            id: "t1".into(),
            name: "read_file".into(),
            arguments: serde_json::json!({}),
        }]);
        assert!(!content.tool_uses_are_answered());
    }

    #[test]
    fn tool_uses_are_answered_true_when_matched() {
        let content = Content::Blocks(vec![
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "read_file".into(),
                arguments: serde_json::json!({}),
            },
            ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "ok".into(),
                is_error: None,
            },
        ]);
        assert!(content.tool_uses_are_answered());
    }

    #[test]
    fn qualified_name_includes_owning_client() {
        let td = ToolDescriptor {
            name: "read_file".into(),
            description: "reads a file".into(),
            input_schema: serde_json::json!({}),
            owning_client_id: "fs-server".into(),
        };
        assert_eq!(td.qualified_name(), "fs-server/read_file");
    }

    #[test]
    fn permission_rule_expiry() {
        let now = Utc::now();
        let rule = PermissionRule {
            tool_name_or_pattern: "bash".into(),
            decision: PermissionDecision::Allow,
            scope: PermissionScope::Session,
            granted_at: now - chrono::Duration::hours(25),
            expires_at: Some(now - chrono::Duration::hours(1)),
        };
        assert!(rule.is_expired(now));
    }

    #[test]
    fn session_round_trips_through_json() {
        let mut s = Session::new("/tmp/workspace", Some("t".into()));
        s.messages.push(Message::user("hi"));
        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.id, s.id);
    }
}
