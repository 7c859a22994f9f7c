//! The store capability set.
//!
//! Workers depend on these traits, never on a concrete backend. Each method
//! is one state transition executed as one transaction; composite operations
//! ([`IterationRecord`], [`CompactionApply`]) exist precisely because their
//! multi-row work must commit atomically.
//!
//! Every write by a worker carries the ownership predicate
//! (`claimed_by = me AND status = expected`); a failed predicate surfaces as
//! [`Error::LostClaim`](mill_domain::Error::LostClaim) and is a normal,
//! silent outcome of rescue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use mill_domain::agent::{Agent, AgentDefinition};
use mill_domain::instance::Instance;
use mill_domain::message::{ContentBlock, Message, Role};
use mill_domain::model::{StopReason, Usage};
use mill_domain::run::{Iteration, NewRun, Run, RunError, RunStatus};
use mill_domain::session::{NewSession, Session};
use mill_domain::tool::{ToolCallSpec, ToolExecution, ToolSpec};
use mill_domain::Result;

use crate::notify::Notification;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Composite operation inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one model iteration produced, committed in one transaction:
/// the assistant message, the iteration row, and — when tool_use blocks are
/// present — the queued tool executions plus the advance to
/// `waiting_for_tools`. Without tool calls the run is marked completed with
/// the assistant text as its result.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub assistant_content: Vec<ContentBlock>,
    pub usage: Usage,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per tool_use block, in emission order.
    pub tool_calls: Vec<ToolCallSpec>,
    /// `max_attempts` stamped on each queued execution.
    pub max_attempts: i32,
}

/// An atomic compaction step: archive the prunable prefix and insert the
/// synthetic summary in its place. Runs under the per-session advisory lock.
#[derive(Debug, Clone)]
pub struct CompactionApply {
    /// Active messages with `seq <= archive_up_to_seq` become superseded.
    pub archive_up_to_seq: i64,
    /// Seq slot for the summary: the minimum seq of the archived range.
    pub summary_seq: i64,
    pub summary_content: Vec<ContentBlock>,
    pub summary_tokens: i64,
}

/// Query filter for [`RunOps::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub session_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    /// 0 means no limit.
    pub limit: i64,
}

/// Terminal or requeue outcome of one tool execution attempt.
#[derive(Debug, Clone)]
pub enum ToolDisposition {
    /// Terminal failure (attempts exhausted or permanent error).
    Failed { error: String },
    /// The tool cancelled itself; terminal.
    Cancelled { error: String },
    /// Unusable call (e.g. schema violation); terminal, never retried.
    Discarded { error: String },
    /// Plain failure with attempts remaining: attempt++ and back on the
    /// queue once `available_at` passes.
    Retry {
        error: String,
        available_at: DateTime<Utc>,
    },
    /// Tool-requested snooze: attempt unchanged, claimable again after
    /// `available_at`.
    Snoozed {
        error: String,
        available_at: DateTime<Utc>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session and message operations.
#[async_trait::async_trait]
pub trait SessionOps {
    async fn create_session(&self, new: NewSession) -> Result<Session>;

    async fn get_session(&self, id: Uuid) -> Result<Session>;

    /// Messages ordered by seq. With `include_archived` the superseded
    /// prefix is returned too; without it only the active window.
    async fn list_messages(&self, session_id: Uuid, include_archived: bool)
        -> Result<Vec<Message>>;

    /// Append one message; seq is assigned `max(seq)+1` under the session's
    /// row lock inside the same transaction.
    async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: Vec<ContentBlock>,
        token_count: i64,
    ) -> Result<Message>;

    /// Apply a compaction plan atomically and bump `compaction_count`.
    /// Returns the inserted summary message.
    async fn apply_compaction(&self, session_id: Uuid, plan: CompactionApply) -> Result<Message>;
}

/// Agent and tool registry operations.
#[async_trait::async_trait]
pub trait RegistryOps {
    /// Insert or fully replace the definition under its unique name.
    async fn upsert_agent(&self, def: AgentDefinition) -> Result<Agent>;

    /// Return the existing agent of that name, or create it.
    async fn get_or_create_agent(&self, def: AgentDefinition) -> Result<Agent>;

    async fn get_agent(&self, id: Uuid) -> Result<Agent>;

    async fn get_agent_by_name(&self, name: &str) -> Result<Agent>;

    async fn upsert_tool(&self, spec: &ToolSpec) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;
}

/// Run queue and state-machine operations.
#[async_trait::async_trait]
pub trait RunOps {
    /// Enqueue a run. Fails with `Conflict` when the session already has a
    /// non-terminal run. Emits `run_ready`.
    async fn create_run(&self, new: NewRun) -> Result<Run>;

    async fn get_run(&self, id: Uuid) -> Result<Run>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>>;

    async fn list_child_runs(&self, parent_run_id: Uuid) -> Result<Vec<Run>>;

    /// Claim the oldest queued run: `queued → running` with
    /// `claimed_by = instance_id`, as a conditional update so that racing
    /// instances see exactly one success.
    async fn claim_run(&self, instance_id: Uuid) -> Result<Option<Run>>;

    /// Refresh `last_heartbeat_at`; `LostClaim` when the row is no longer
    /// ours.
    async fn heartbeat_run(&self, run_id: Uuid, instance_id: Uuid) -> Result<()>;

    /// Commit one iteration (see [`IterationRecord`]). Emits `tool_ready`
    /// when executions were queued, `run_completed` when the run finished.
    async fn record_iteration(
        &self,
        run_id: Uuid,
        instance_id: Uuid,
        rec: IterationRecord,
    ) -> Result<Iteration>;

    /// `waiting_for_tools → running` once the tool gate opens.
    async fn resume_run(&self, run_id: Uuid, instance_id: Uuid) -> Result<()>;

    /// Terminal failure written by the owning worker (or, with
    /// `instance_id = None`, by rescue). Emits `run_completed`.
    async fn fail_run(
        &self,
        run_id: Uuid,
        instance_id: Option<Uuid>,
        error: RunError,
    ) -> Result<()>;

    /// Caller-requested cancellation of a non-terminal run. Emits
    /// `run_completed`.
    async fn cancel_run(&self, run_id: Uuid) -> Result<()>;

    /// Rescue: return a stuck run to the queue, clearing the claim and
    /// incrementing `attempt`. Emits `run_ready`.
    async fn requeue_run(&self, run_id: Uuid) -> Result<()>;

    /// Runs in running/waiting_for_tools whose heartbeat is older than
    /// `before`.
    async fn find_stuck_runs(&self, before: DateTime<Utc>) -> Result<Vec<Run>>;

    async fn list_iterations(&self, run_id: Uuid) -> Result<Vec<Iteration>>;
}

/// Tool execution queue operations.
#[async_trait::async_trait]
pub trait ToolOps {
    /// Claim one claimable execution with `available_at <= now`:
    /// `queued|snoozed → running` bound to `instance_id`.
    async fn claim_tool_execution(&self, instance_id: Uuid) -> Result<Option<ToolExecution>>;

    async fn get_tool_execution(&self, te_id: Uuid) -> Result<ToolExecution>;

    async fn heartbeat_tool_execution(&self, te_id: Uuid, instance_id: Uuid) -> Result<()>;

    /// Terminal success. Emits `tool_completed` for the owning run.
    async fn complete_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        output: serde_json::Value,
    ) -> Result<()>;

    /// Any non-success outcome (see [`ToolDisposition`]). Emits
    /// `tool_completed`, and `tool_ready` again for requeue/snooze.
    async fn fail_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        disposition: ToolDisposition,
    ) -> Result<()>;

    /// Give the claim back without progress — the one legitimate unclaim,
    /// used when the tool is not registered on this instance. The row
    /// becomes claimable again at `available_at`.
    async fn release_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        available_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_tool_executions(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>>;

    /// Executions in running state whose heartbeat is older than `before`.
    async fn find_stuck_tool_executions(&self, before: DateTime<Utc>)
        -> Result<Vec<ToolExecution>>;

    /// Rescue: requeue a stuck execution; the abandoned attempt counts as
    /// consumed. Emits `tool_ready`.
    async fn requeue_tool_execution(&self, te_id: Uuid) -> Result<()>;

    /// Rescue gave up: terminal failure without an ownership predicate.
    async fn fail_tool_rescued(&self, te_id: Uuid, error: String) -> Result<()>;
}

/// Instance registration, leader lease, and event subscription.
#[async_trait::async_trait]
pub trait CoordinationOps {
    /// Insert (or re-insert after purge) this process's instance row.
    async fn register_instance(&self, instance: &Instance) -> Result<()>;

    /// Refresh the heartbeat. Returns false when the row is gone and must
    /// be re-registered.
    async fn refresh_instance(&self, id: Uuid) -> Result<bool>;

    async fn remove_instance(&self, id: Uuid) -> Result<()>;

    async fn delete_stale_instances(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Take the singleton lease when it is free or expired. Staleness, not
    /// wall-clock races, decides take-over.
    async fn try_acquire_leader(&self, instance_id: Uuid, ttl: Duration) -> Result<bool>;

    /// Extend the lease; false when someone else holds it (or it is gone).
    async fn renew_leader(&self, instance_id: Uuid, ttl: Duration) -> Result<bool>;

    async fn release_leader(&self, instance_id: Uuid) -> Result<()>;

    /// Subscribe to the notification stream (LISTEN channels on Postgres,
    /// in-process broadcast on the memory backend). Hints only — receivers
    /// re-read rows before acting.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;
}

/// The full capability set workers are generic over.
pub trait Store:
    SessionOps + RegistryOps + RunOps + ToolOps + CoordinationOps + Send + Sync + 'static
{
}

impl<T> Store for T where
    T: SessionOps + RegistryOps + RunOps + ToolOps + CoordinationOps + Send + Sync + 'static
{
}
