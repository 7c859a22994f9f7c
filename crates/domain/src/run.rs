//! Run and iteration rows — the persistent state machine every worker drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::StopReason;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingForTools,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingForTools => "waiting_for_tools",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Machine-readable terminal error persisted on a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error recorded when rescue gives up on a run.
    pub fn rescue_exhausted(attempts: i32) -> Self {
        Self::new(
            ErrorKind::Transient,
            format!("rescue exhausted after {attempts} attempts"),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One orchestrated execution of an agent against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_id: Uuid,
    /// Set for delegated child runs; forms the run DAG.
    pub parent_run_id: Option<Uuid>,
    pub input_prompt: String,
    /// Free-form variables surfaced to tool executions.
    pub variables: serde_json::Value,
    pub status: RunStatus,
    /// Incremented each time rescue returns the run to the queue.
    pub attempt: i32,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Final assistant text, set on completion.
    pub result: Option<String>,
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for enqueuing a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub input_prompt: String,
    pub variables: serde_json::Value,
}

impl NewRun {
    pub fn new(session_id: Uuid, agent_id: Uuid, prompt: impl Into<String>) -> Self {
        Self {
            session_id,
            agent_id,
            parent_run_id: None,
            input_prompt: prompt.into(),
            variables: serde_json::Value::Null,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Iteration record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One model request/response pair within a run. Append-only; used to
/// reconstruct cost and usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Strictly increasing per run.
    pub seq: i64,
    pub input_token_count: i64,
    pub output_token_count: i64,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::WaitingForTools.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::WaitingForTools).unwrap(),
            "\"waiting_for_tools\""
        );
        let s: RunStatus = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(s, RunStatus::Queued);
    }

    #[test]
    fn run_error_round_trip() {
        let e = RunError::rescue_exhausted(3);
        let v = serde_json::to_value(&e).unwrap();
        let back: RunError = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }
}
