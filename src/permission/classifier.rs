//! Risk Classifier: maps (tool-name, arguments) -> {low, medium, high}
//! (spec §2, §4.4 step 4). No direct teacher analog exists — the teacher
//! carries no permission layer — so this is authored fresh from the
//! spec's own heuristic list.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Curated tool-name sets that shortcut classification (spec GLOSSARY:
/// "Safe-read list / always-prompt list").
const SAFE_READ_NAMES: &[&str] = &[
    "read_file",
    "list_files",
    "search",
    "grep",
    "glob",
    "list_directory",
    "get_file_info",
];

const ALWAYS_PROMPT_NAMES: &[&str] = &["write_file", "delete_file", "execute_command", "shell", "bash"];

const WRITE_OR_DELETE_PATTERNS: &[&str] = &["write", "delete", "remove", "rm", "drop"];
const NETWORK_PATTERNS: &[&str] = &["http", "fetch", "curl", "request", "download"];
const SHELL_PATTERNS: &[&str] = &["exec", "shell", "bash", "command", "eval"];

#[derive(Default)]
pub struct RiskClassifier;

impl RiskClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn is_safe_read(&self, tool_name: &str) -> bool {
        SAFE_READ_NAMES.contains(&tool_name)
    }

    pub fn is_always_prompt(&self, tool_name: &str) -> bool {
        ALWAYS_PROMPT_NAMES.contains(&tool_name)
    }

    /// Classifies risk from name patterns (writes, deletes, network
    /// egress, path traversal, shell expansion) and from arguments
    /// (absolute paths outside workspace, wildcard deletes, unbounded
    /// network URLs).
    pub fn classify(&self, tool_name: &str, arguments: &Value, workspace: &str) -> RiskLevel {
        let lower = tool_name.to_lowercase();

        let name_is_shell = SHELL_PATTERNS.iter().any(|p| lower.contains(p));
        let name_is_write_or_delete = WRITE_OR_DELETE_PATTERNS.iter().any(|p| lower.contains(p));
        let name_is_network = NETWORK_PATTERNS.iter().any(|p| lower.contains(p));

        if name_is_shell {
            return RiskLevel::High;
        }

        let args_risky = self.arguments_look_risky(arguments, workspace);

        if name_is_write_or_delete && args_risky {
            return RiskLevel::High;
        }
        if name_is_write_or_delete || name_is_network {
            return RiskLevel::Medium;
        }
        if args_risky {
            return RiskLevel::Medium;
        }

        RiskLevel::Low
    }

    fn arguments_look_risky(&self, arguments: &Value, workspace: &str) -> bool {
        match arguments {
            Value::Object(map) => map.values().any(|v| self.arguments_look_risky(v, workspace)),
            Value::Array(items) => items.iter().any(|v| self.arguments_look_risky(v, workspace)),
            Value::String(s) => {
                let path_outside_workspace = s.starts_with('/') && !s.starts_with(workspace);
                let wildcard_delete = s.contains('*') && (s.contains("rm") || s.contains("delete"));
                let unbounded_url = s.starts_with("http://") || s.starts_with("https://");
                path_outside_workspace || wildcard_delete || unbounded_url
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_tool_names_are_always_high_risk() {
        let classifier = RiskClassifier::new();
        let level = classifier.classify("execute_command", &serde_json::json!({}), "/ws");
        assert_eq!(level, RiskLevel::High);
    }

    #[test]
    fn write_with_path_outside_workspace_is_high_risk() {
        let classifier = RiskClassifier::new();
        let level = classifier.classify(
            "write_file",
            &serde_json::json!({"path": "/etc/passwd"}),
            "/home/user/ws",
        );
        assert_eq!(level, RiskLevel::High);
    }

    #[test]
    fn write_within_workspace_is_medium_risk() {
        let classifier = RiskClassifier::new();
        let level = classifier.classify(
            "write_file",
            &serde_json::json!({"path": "/home/user/ws/a.txt"}),
            "/home/user/ws",
        );
        assert_eq!(level, RiskLevel::Medium);
    }

    #[test]
    fn plain_read_is_low_risk() {
        let classifier = RiskClassifier::new();
        let level = classifier.classify(
            "read_file",
            &serde_json::json!({"path": "/home/user/ws/a.txt"}),
            "/home/user/ws",
        );
        assert_eq!(level, RiskLevel::Low);
    }

    #[test]
    fn safe_read_and_always_prompt_lists_are_consulted_separately() {
        let classifier = RiskClassifier::new();
        assert!(classifier.is_safe_read("read_file"));
        assert!(classifier.is_always_prompt("execute_command"));
        assert!(!classifier.is_safe_read("execute_command"));
    }
}
