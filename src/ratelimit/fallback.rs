//! Fallback agent resolution and active-agent tracking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maps a rate-limited agent to the agent that should stand in for it.
///
/// Per-invocation overrides win over the persisted global mapping.
#[derive(Debug, Clone, Default)]
pub struct FallbackResolver {
    /// Override applied to any primary (e.g. `--fallback-agent`).
    invocation_default: Option<String>,
    /// Per-invocation overrides keyed by primary agent.
    invocation: HashMap<String, String>,
    /// Persisted mapping from configuration.
    global: HashMap<String, String>,
}

impl FallbackResolver {
    pub fn new(global: HashMap<String, String>) -> Self {
        Self {
            global,
            ..Default::default()
        }
    }

    /// Use `agent_id` as the fallback for every primary during this invocation.
    pub fn with_invocation_default(mut self, agent_id: impl Into<String>) -> Self {
        self.invocation_default = Some(agent_id.into());
        self
    }

    /// Use `fallback` for `primary` during this invocation.
    pub fn with_invocation_override(mut self, primary: impl Into<String>, fallback: impl Into<String>) -> Self {
        self.invocation.insert(primary.into(), fallback.into());
        self
    }

    /// The fallback for `agent_id`, or None to stay on it and wait out the backoff.
    pub fn get_fallback_agent(&self, agent_id: &str) -> Option<String> {
        self.invocation
            .get(agent_id)
            .or(self.invocation_default.as_ref())
            .or_else(|| self.global.get(agent_id))
            .filter(|fallback| fallback.as_str() != agent_id)
            .cloned()
    }
}

/// Why the active agent is the one running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentReason {
    Primary,
    Fallback,
}

/// Which agent the engine launches next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveAgentState {
    primary: String,
    agent_id: String,
    reason: AgentReason,
}

impl ActiveAgentState {
    pub fn new(primary: impl Into<String>) -> Self {
        let primary = primary.into();
        Self {
            agent_id: primary.clone(),
            primary,
            reason: AgentReason::Primary,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn reason(&self) -> AgentReason {
        self.reason
    }

    pub fn is_fallback(&self) -> bool {
        self.reason == AgentReason::Fallback
    }

    /// Substitute `fallback`. Returns false if it is already active.
    pub fn switch_to_fallback(&mut self, fallback: impl Into<String>) -> bool {
        let fallback = fallback.into();
        if fallback == self.agent_id {
            return false;
        }
        self.agent_id = fallback;
        self.reason = AgentReason::Fallback;
        true
    }

    /// Return to the primary agent. Returns false if it is already active.
    pub fn restore_primary(&mut self) -> bool {
        if !self.is_fallback() {
            return false;
        }
        self.agent_id = self.primary.clone();
        self.reason = AgentReason::Primary;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> HashMap<String, String> {
        HashMap::from([("claude".to_string(), "opencode".to_string())])
    }

    #[test]
    fn test_global_mapping() {
        let resolver = FallbackResolver::new(global());
        assert_eq!(resolver.get_fallback_agent("claude"), Some("opencode".to_string()));
        assert_eq!(resolver.get_fallback_agent("codex"), None);
    }

    #[test]
    fn test_invocation_override_wins() {
        let resolver = FallbackResolver::new(global()).with_invocation_override("claude", "gemini");
        assert_eq!(resolver.get_fallback_agent("claude"), Some("gemini".to_string()));

        let resolver = FallbackResolver::new(global()).with_invocation_default("codex");
        assert_eq!(resolver.get_fallback_agent("claude"), Some("codex".to_string()));
        assert_eq!(resolver.get_fallback_agent("gemini"), Some("codex".to_string()));
    }

    #[test]
    fn test_fallback_to_self_is_none() {
        let resolver = FallbackResolver::default().with_invocation_default("claude");
        assert_eq!(resolver.get_fallback_agent("claude"), None);
    }

    #[test]
    fn test_active_agent_switch_and_restore() {
        let mut state = ActiveAgentState::new("claude");
        assert_eq!(state.reason(), AgentReason::Primary);
        assert!(!state.restore_primary());

        assert!(state.switch_to_fallback("opencode"));
        assert_eq!(state.agent_id(), "opencode");
        assert!(state.is_fallback());
        assert!(!state.switch_to_fallback("opencode"));

        assert!(state.restore_primary());
        assert_eq!(state.agent_id(), "claude");
        assert_eq!(state.reason(), AgentReason::Primary);
    }

    #[test]
    fn test_agent_reason_serialization() {
        assert_eq!(serde_json::to_string(&AgentReason::Fallback).unwrap(), "\"fallback\"");
    }
}
