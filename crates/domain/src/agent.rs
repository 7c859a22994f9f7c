//! Agent definitions — named, versioned behavioral configurations.
//!
//! An agent pins the model, system prompt, sampling parameters, the concrete
//! tools it may call, and the sub-agents it may delegate to. Runs reference
//! agents by id; the definition itself lives in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted agent definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Unique within the deployment.
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Names of registered tools this agent may invoke.
    pub tools: Vec<String>,
    /// Sub-agents this agent may delegate to; each is projected to the model
    /// as a tool.
    pub agent_ids: Vec<Uuid>,
    pub config: AgentConfig,
    pub created_at: DateTime<Utc>,
}

/// Per-agent behavioral knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Run compaction automatically between iterations.
    pub auto_compaction: bool,
    /// Request the provider's extended context window.
    pub extended_context: bool,
    /// Fraction of the context window that triggers compaction.
    pub compaction_trigger: f64,
    /// Token budget the active window must fit after compaction.
    pub compaction_target: i64,
    /// Trailing messages always preserved verbatim.
    pub compaction_preserve_n: usize,
    /// Trailing token budget always preserved verbatim.
    pub compaction_protected_tokens: i64,
    /// Model used for summarize-strategy compaction. Empty = the agent's own
    /// model.
    pub summarizer_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auto_compaction: true,
            extended_context: false,
            compaction_trigger: 0.8,
            compaction_target: 50_000,
            compaction_preserve_n: 10,
            compaction_protected_tokens: 4_000,
            summarizer_model: String::new(),
        }
    }
}

impl AgentConfig {
    /// Context window in tokens implied by the extended-context flag.
    pub fn context_window(&self) -> i64 {
        if self.extended_context {
            1_000_000
        } else {
            200_000
        }
    }

    /// Token count at which compaction kicks in.
    pub fn compaction_trigger_tokens(&self) -> i64 {
        (self.compaction_trigger * self.context_window() as f64) as i64
    }
}

/// Input for creating or upserting an agent.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Vec<String>,
    pub agent_ids: Vec<Uuid>,
    pub config: AgentConfig,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            system_prompt: String::new(),
            max_tokens: None,
            temperature: None,
            tools: Vec::new(),
            agent_ids: Vec::new(),
            config: AgentConfig::default(),
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn sub_agents(mut self, agent_ids: Vec<Uuid>) -> Self {
        self.agent_ids = agent_ids;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_round_trip() {
        let cfg = AgentConfig::default();
        let v = serde_json::to_value(&cfg).unwrap();
        let back: AgentConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let cfg: AgentConfig =
            serde_json::from_value(serde_json::json!({"auto_compaction": false})).unwrap();
        assert!(!cfg.auto_compaction);
        assert_eq!(cfg.compaction_preserve_n, 10);
    }

    #[test]
    fn extended_context_window() {
        let mut cfg = AgentConfig::default();
        assert_eq!(cfg.context_window(), 200_000);
        cfg.extended_context = true;
        assert_eq!(cfg.context_window(), 1_000_000);
        assert_eq!(cfg.compaction_trigger_tokens(), 800_000);
    }
}
