//! Row structs and conversions between SQL shapes and domain types.
//!
//! Statuses are stored as text with CHECK constraints; JSON-typed columns
//! use `sqlx::types::Json`. Conversions are infallible except for status
//! parsing, which only fails if the database was edited by hand.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use mill_domain::agent::{Agent, AgentConfig};
use mill_domain::instance::Instance;
use mill_domain::message::{ContentBlock, Message, Role};
use mill_domain::model::StopReason;
use mill_domain::run::{Iteration, Run, RunError, RunStatus};
use mill_domain::session::Session;
use mill_domain::tool::{ToolExecution, ToolKind, ToolSpec, ToolStatus};
use mill_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status text mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn run_status(s: &str) -> Result<RunStatus> {
    match s {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "waiting_for_tools" => Ok(RunStatus::WaitingForTools),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(Error::InvariantViolation(format!(
            "unknown run status {other:?}"
        ))),
    }
}

pub(crate) fn tool_status(s: &str) -> Result<ToolStatus> {
    match s {
        "queued" => Ok(ToolStatus::Queued),
        "running" => Ok(ToolStatus::Running),
        "succeeded" => Ok(ToolStatus::Succeeded),
        "failed" => Ok(ToolStatus::Failed),
        "cancelled" => Ok(ToolStatus::Cancelled),
        "discarded" => Ok(ToolStatus::Discarded),
        "snoozed" => Ok(ToolStatus::Snoozed),
        other => Err(Error::InvariantViolation(format!(
            "unknown tool status {other:?}"
        ))),
    }
}

pub(crate) fn role(s: &str) -> Result<Role> {
    match s {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool_result" => Ok(Role::ToolResult),
        "system-summary" => Ok(Role::SystemSummary),
        other => Err(Error::InvariantViolation(format!(
            "unknown message role {other:?}"
        ))),
    }
}

pub(crate) fn role_str(r: Role) -> &'static str {
    match r {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::ToolResult => "tool_result",
        Role::SystemSummary => "system-summary",
    }
}

pub(crate) fn stop_reason(s: &str) -> Result<StopReason> {
    match s {
        "end_turn" => Ok(StopReason::EndTurn),
        "max_tokens" => Ok(StopReason::MaxTokens),
        "tool_use" => Ok(StopReason::ToolUse),
        "stop_sequence" => Ok(StopReason::StopSequence),
        other => Err(Error::InvariantViolation(format!(
            "unknown stop reason {other:?}"
        ))),
    }
}

pub(crate) fn stop_reason_str(r: StopReason) -> &'static str {
    match r {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::ToolUse => "tool_use",
        StopReason::StopSequence => "stop_sequence",
    }
}

pub(crate) fn tool_kind(s: &str) -> Result<ToolKind> {
    match s {
        "tool" => Ok(ToolKind::Tool),
        "agent" => Ok(ToolKind::Agent),
        other => Err(Error::InvariantViolation(format!(
            "unknown tool kind {other:?}"
        ))),
    }
}

pub(crate) fn tool_kind_str(k: ToolKind) -> &'static str {
    match k {
        ToolKind::Tool => "tool",
        ToolKind::Agent => "agent",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(FromRow)]
pub(crate) struct SessionRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub identifier: String,
    pub parent_session_id: Option<Uuid>,
    pub metadata: Json<serde_json::Value>,
    pub compaction_count: i32,
    pub created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(r: SessionRow) -> Self {
        Session {
            id: r.id,
            tenant_id: r.tenant_id,
            identifier: r.identifier,
            parent_session_id: r.parent_session_id,
            metadata: r.metadata.0,
            compaction_count: r.compaction_count,
            created_at: r.created_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct MessageRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub seq: i64,
    pub role: String,
    pub content: Json<Vec<ContentBlock>>,
    pub token_count: i64,
    pub is_summary: bool,
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(r: MessageRow) -> Result<Self> {
        Ok(Message {
            id: r.id,
            session_id: r.session_id,
            seq: r.seq,
            role: role(&r.role)?,
            content: r.content.0,
            token_count: r.token_count,
            is_summary: r.is_summary,
            superseded: r.superseded,
            created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct AgentRow {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f32>,
    pub tools: Vec<String>,
    pub agent_ids: Vec<Uuid>,
    pub config: Json<AgentConfig>,
    pub created_at: DateTime<Utc>,
}

impl From<AgentRow> for Agent {
    fn from(r: AgentRow) -> Self {
        Agent {
            id: r.id,
            name: r.name,
            model: r.model,
            system_prompt: r.system_prompt,
            max_tokens: r.max_tokens.map(|v| v as u32),
            temperature: r.temperature,
            tools: r.tools,
            agent_ids: r.agent_ids,
            config: r.config.0,
            created_at: r.created_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct ToolRow {
    pub name: String,
    pub description: String,
    pub input_schema: Json<serde_json::Value>,
}

impl From<ToolRow> for ToolSpec {
    fn from(r: ToolRow) -> Self {
        ToolSpec {
            name: r.name,
            description: r.description,
            input_schema: r.input_schema.0,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct RunRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub input_prompt: String,
    pub variables: Json<serde_json::Value>,
    pub status: String,
    pub attempt: i32,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<Json<RunError>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = Error;

    fn try_from(r: RunRow) -> Result<Self> {
        Ok(Run {
            id: r.id,
            session_id: r.session_id,
            agent_id: r.agent_id,
            parent_run_id: r.parent_run_id,
            input_prompt: r.input_prompt,
            variables: r.variables.0,
            status: run_status(&r.status)?,
            attempt: r.attempt,
            claimed_by: r.claimed_by,
            claimed_at: r.claimed_at,
            last_heartbeat_at: r.last_heartbeat_at,
            result: r.result,
            error: r.error.map(|j| j.0),
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct IterationRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub seq: i64,
    pub input_token_count: i64,
    pub output_token_count: i64,
    pub stop_reason: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TryFrom<IterationRow> for Iteration {
    type Error = Error;

    fn try_from(r: IterationRow) -> Result<Self> {
        Ok(Iteration {
            id: r.id,
            run_id: r.run_id,
            seq: r.seq,
            input_token_count: r.input_token_count,
            output_token_count: r.output_token_count,
            stop_reason: stop_reason(&r.stop_reason)?,
            started_at: r.started_at,
            finished_at: r.finished_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct ToolExecutionRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_id: Uuid,
    pub tool_use_id: String,
    pub tool_name: String,
    pub kind: String,
    pub ord: i32,
    pub input: Json<serde_json::Value>,
    pub status: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub output: Option<Json<serde_json::Value>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ToolExecutionRow> for ToolExecution {
    type Error = Error;

    fn try_from(r: ToolExecutionRow) -> Result<Self> {
        Ok(ToolExecution {
            id: r.id,
            run_id: r.run_id,
            iteration_id: r.iteration_id,
            tool_use_id: r.tool_use_id,
            tool_name: r.tool_name,
            kind: tool_kind(&r.kind)?,
            ord: r.ord,
            input: r.input.0,
            status: tool_status(&r.status)?,
            attempt: r.attempt,
            max_attempts: r.max_attempts,
            claimed_by: r.claimed_by,
            claimed_at: r.claimed_at,
            last_heartbeat_at: r.last_heartbeat_at,
            available_at: r.available_at,
            output: r.output.map(|j| j.0),
            error: r.error,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct InstanceRow {
    pub id: Uuid,
    pub name: String,
    pub metadata: Json<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl From<InstanceRow> for Instance {
    fn from(r: InstanceRow) -> Self {
        Instance {
            id: r.id,
            name: r.name,
            metadata: r.metadata.0,
            started_at: r.started_at,
            last_heartbeat_at: r.last_heartbeat_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trips() {
        for s in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::WaitingForTools,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(run_status(s.as_str()).unwrap(), s);
        }
        for s in [
            ToolStatus::Queued,
            ToolStatus::Running,
            ToolStatus::Succeeded,
            ToolStatus::Failed,
            ToolStatus::Cancelled,
            ToolStatus::Discarded,
            ToolStatus::Snoozed,
        ] {
            assert_eq!(tool_status(s.as_str()).unwrap(), s);
        }
        assert!(run_status("paused").is_err());
    }

    #[test]
    fn role_text_round_trips() {
        for r in [
            Role::User,
            Role::Assistant,
            Role::ToolResult,
            Role::SystemSummary,
        ] {
            assert_eq!(role(role_str(r)).unwrap(), r);
        }
    }

    #[test]
    fn stop_reason_text_round_trips() {
        for r in [
            StopReason::EndTurn,
            StopReason::MaxTokens,
            StopReason::ToolUse,
            StopReason::StopSequence,
        ] {
            assert_eq!(stop_reason(stop_reason_str(r)).unwrap(), r);
        }
    }
}
