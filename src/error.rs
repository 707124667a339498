//! Error taxonomy for the agent core.
//!
//! Mirrors the hand-rolled enum-plus-manual-`Display` idiom used throughout
//! the rest of this crate (see `tool_protocol::ToolError` in the legacy
//! tree) rather than pulling in a derive-macro error crate.

use std::error::Error;
use std::fmt;

/// Stable error kind, matching the `code()` column callers can match on
/// without string-comparing `Display` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthFailed,
    RateLimited,
    ServerError,
    NetworkError,
    Timeout,
    StreamError,
    ToolExecutionError,
    PermissionDenied,
    ValidationError,
    ConfigError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::StreamError => "STREAM_ERROR",
            ErrorKind::ToolExecutionError => "TOOL_EXECUTION_ERROR",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::ConfigError => "CONFIG_ERROR",
        }
    }

    /// Whether the conversation can continue after this error without a
    /// fresh `sendMessage` call from the caller.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ToolExecutionError
                | ErrorKind::PermissionDenied
                | ErrorKind::ValidationError
        )
    }
}

/// The crate's single error type. Carries a stable `code` and optional
/// structured `details`; user-facing formatting is left to the caller.
#[derive(Debug, Clone)]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn recoverable(&self) -> bool {
        self.kind.recoverable()
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn stream_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StreamError, message)
    }

    pub fn tool_execution_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecutionError, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, message)
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl Error for AgentError {}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::validation_error(e.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::new(ErrorKind::NetworkError, e.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_spec_table() {
        assert_eq!(ErrorKind::AuthFailed.code(), "AUTH_FAILED");
        assert_eq!(ErrorKind::RateLimited.code(), "RATE_LIMITED");
        assert_eq!(ErrorKind::ServerError.code(), "SERVER_ERROR");
        assert_eq!(ErrorKind::NetworkError.code(), "NETWORK_ERROR");
        assert_eq!(ErrorKind::Timeout.code(), "TIMEOUT");
        assert_eq!(ErrorKind::StreamError.code(), "STREAM_ERROR");
        assert_eq!(ErrorKind::ToolExecutionError.code(), "TOOL_EXECUTION_ERROR");
        assert_eq!(ErrorKind::PermissionDenied.code(), "PERMISSION_DENIED");
        assert_eq!(ErrorKind::ValidationError.code(), "VALIDATION_ERROR");
        assert_eq!(ErrorKind::ConfigError.code(), "CONFIG_ERROR");
    }

    #[test]
    fn recoverability_matches_spec_principle() {
        assert!(!ErrorKind::AuthFailed.recoverable());
        assert!(!ErrorKind::StreamError.recoverable());
        assert!(ErrorKind::Timeout.recoverable());
        assert!(ErrorKind::ToolExecutionError.recoverable());
        assert!(ErrorKind::PermissionDenied.recoverable());
        assert!(ErrorKind::ValidationError.recoverable());
    }

    #[test]
    fn display_includes_code_and_message() {
        let e = AgentError::timeout("tool call exceeded 30s");
        let s = e.to_string();
        assert!(s.contains("TIMEOUT"));
        assert!(s.contains("30s"));
    }
}
