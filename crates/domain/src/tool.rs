//! Tools: registration specs, execution rows, and the handler interface.
//!
//! Tool control flow (cancel / discard / snooze) is a sum type returned by
//! handlers, not an exception hierarchy; the tool worker maps each variant
//! onto a persisted status transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered callable exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique per client.
    pub name: String,
    pub description: String,
    /// JSON Schema subset; top level must be `type = "object"`.
    pub input_schema: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Discarded,
    /// Put back by the tool itself; claimable again once `available_at`
    /// passes, without consuming an attempt.
    Snoozed,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Discarded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Discarded => "discarded",
            Self::Snoozed => "snoozed",
        }
    }

    /// Claimable by a tool worker once `available_at` passes.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Queued | Self::Snoozed)
    }
}

/// What a queued execution refers to: a registered tool, or a sub-agent
/// projected as a tool (delegation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Tool,
    Agent,
}

/// One tool invocation requested by one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_id: Uuid,
    /// The id the model assigned to the tool_use block.
    pub tool_use_id: String,
    pub tool_name: String,
    pub kind: ToolKind,
    /// Position of the tool_use block within its iteration; tool_result
    /// messages are appended in this order.
    pub ord: i32,
    pub input: serde_json::Value,
    pub status: ToolStatus,
    /// Which execution attempt this row currently represents (1-based).
    pub attempt: i32,
    pub max_attempts: i32,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Earliest claimable time; snooze and retry delays push it forward.
    pub available_at: DateTime<Utc>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for enqueueing one execution (from one tool_use block).
#[derive(Debug, Clone)]
pub struct ToolCallSpec {
    pub tool_use_id: String,
    pub tool_name: String,
    pub kind: ToolKind,
    pub input: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler interface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context surfaced to a tool implementation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub variables: serde_json::Value,
}

/// Control-flow signals a tool implementation may return instead of output.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Stop this call permanently; no further attempts.
    #[error("cancelled: {0}")]
    Cancel(String),

    /// Drop this call as unusable (e.g. invalid input); no further attempts.
    #[error("discarded: {0}")]
    Discard(String),

    /// Put the call back on the queue without consuming an attempt; it
    /// becomes claimable again after `delay`. Unbounded snoozes permitted.
    #[error("snoozed for {delay:?}: {reason}")]
    Snooze { delay: Duration, reason: String },

    /// Ordinary failure; consumes an attempt and retries per policy.
    #[error("{0}")]
    Fail(String),
}

impl ToolError {
    pub fn snooze(delay: Duration, reason: impl Into<String>) -> Self {
        Self::Snooze {
            delay,
            reason: reason.into(),
        }
    }
}

/// A tool implementation registered with the client.
///
/// Implementations are resolved by name on whichever instance claims the
/// execution; an instance without the implementation releases the claim.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn invoke(
        &self,
        ctx: ToolContext,
        input: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError>;
}
