//! Permission Manager: consults the store and classifier; exposes
//! `check(tool, args)` and `record(tool, decision, scope)` (spec §4.4).

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::model::{PermissionDecision, PermissionRule, PermissionScope, PermissionsFile};
use crate::permission::classifier::{RiskClassifier, RiskLevel};
use crate::permission::store::PermissionStore;

const DEFAULT_SESSION_WINDOW_HOURS: i64 = 24;

pub struct PermissionManager {
    store: PermissionStore,
    classifier: RiskClassifier,
    workspace: String,
    rules: RwLock<HashMap<String, PermissionRule>>,
}

impl PermissionManager {
    /// Loads any previously persisted rules from
    /// `<workspace>/.floyd/permissions.json` into memory.
    pub async fn load(workspace: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let store = PermissionStore::new(&workspace);
        let file: PermissionsFile = store.load().await;
        Self {
            store,
            classifier: RiskClassifier::new(),
            workspace,
            rules: RwLock::new(file.decisions),
        }
    }

    /// Decision procedure (spec §4.4):
    /// 1. exact-name rule, then most-specific pattern rule, dropping
    ///    expired rules.
    /// 2. safe-read list -> allow.
    /// 3. always-prompt list -> ask.
    /// 4. risk classification: low -> allow, medium/high -> ask.
    pub async fn check(&self, tool_name: &str, arguments: &Value) -> PermissionDecision {
        if let Some(rule) = self.find_active_rule(tool_name).await {
            return rule.decision;
        }

        if self.classifier.is_safe_read(tool_name) {
            return PermissionDecision::Allow;
        }
        if self.classifier.is_always_prompt(tool_name) {
            return PermissionDecision::Ask;
        }

        match self.classifier.classify(tool_name, arguments, &self.workspace) {
            RiskLevel::Low => PermissionDecision::Allow,
            RiskLevel::Medium | RiskLevel::High => PermissionDecision::Ask,
        }
    }

    /// Risk level for a tool call, independent of any active rule or
    /// curated list — used by callers (the Engine) to supply a risk
    /// level to the external permission-prompt collaborator on `ask`.
    pub fn classify_risk(&self, tool_name: &str, arguments: &Value) -> RiskLevel {
        self.classifier.classify(tool_name, arguments, &self.workspace)
    }

    async fn find_active_rule(&self, tool_name: &str) -> Option<PermissionRule> {
        let now = Utc::now();
        let mut rules = self.rules.write().await;

        if let Some(rule) = rules.get(tool_name) {
            if rule.is_expired(now) {
                rules.remove(tool_name);
            } else {
                let rule = rule.clone();
                if rule.scope == PermissionScope::Once {
                    rules.remove(tool_name);
                }
                return Some(rule);
            }
        }

        let mut best: Option<(usize, String)> = None;
        for pattern in rules.keys() {
            if pattern_matches(pattern, tool_name) {
                let specificity = pattern.len();
                if best.as_ref().map(|(len, _)| specificity > *len).unwrap_or(true) {
                    best = Some((specificity, pattern.clone()));
                }
            }
        }

        if let Some((_, pattern)) = best {
            let rule = rules.get(&pattern)?.clone();
            if rule.is_expired(now) {
                rules.remove(&pattern);
                return None;
            }
            if rule.scope == PermissionScope::Once {
                rules.remove(&pattern);
            }
            return Some(rule);
        }

        None
    }

    /// Records a decision under the given scope. `once` rules expire
    /// after their first consultation (handled in `find_active_rule`);
    /// `session` rules expire after the default 24h window; `persistent`
    /// rules never expire and are written through to the store.
    pub async fn record(&self, tool_name_or_pattern: &str, decision: PermissionDecision, scope: PermissionScope) {
        let now = Utc::now();
        let expires_at = match scope {
            PermissionScope::Once => None,
            PermissionScope::Session => Some(now + ChronoDuration::hours(DEFAULT_SESSION_WINDOW_HOURS)),
            PermissionScope::Persistent => None,
        };

        let rule = PermissionRule {
            tool_name_or_pattern: tool_name_or_pattern.to_string(),
            decision,
            scope,
            granted_at: now,
            expires_at,
        };

        {
            let mut rules = self.rules.write().await;
            rules.insert(tool_name_or_pattern.to_string(), rule);
        }

        if scope == PermissionScope::Persistent {
            // Persistence failures are logged but never block the
            // in-memory decision (spec §4.6 failure semantics).
            if let Err(e) = self.persist().await {
                log::error!("failed to persist permission rule for '{tool_name_or_pattern}': {e}");
            }
        }
    }

    async fn persist(&self) -> Result<(), crate::error::AgentError> {
        let rules = self.rules.read().await;
        let persistent: HashMap<String, PermissionRule> = rules
            .iter()
            .filter(|(_, r)| r.scope == PermissionScope::Persistent)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let file = PermissionsFile {
            version: 1,
            decisions: persistent,
            remember_until: None,
            updated_at: Utc::now(),
        };
        self.store.save(&file).await
    }
}

/// Supports `prefix*`, `*suffix`, and exact patterns. A bare pattern with
/// no wildcard is treated as an exact match (already handled by the
/// exact-name lookup, but kept total here for the pattern scan).
fn pattern_matches(pattern: &str, tool_name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        tool_name.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        tool_name.ends_with(suffix)
    } else {
        pattern == tool_name
    }
}
