//! In-process store backend.
//!
//! Implements the full capability set with the same claim, seq, and
//! notification semantics as the Postgres backend: one mutex held for the
//! duration of each operation plays the role of the transaction, and an
//! in-process broadcast channel plays the role of LISTEN/NOTIFY. Used by
//! the test suites and by embedders that want the orchestrator without a
//! database.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use mill_domain::agent::{Agent, AgentDefinition};
use mill_domain::instance::{Instance, LeaderLease};
use mill_domain::message::{estimate_tokens, ContentBlock, Message, Role};
use mill_domain::run::{Iteration, NewRun, Run, RunError, RunStatus};
use mill_domain::session::{NewSession, Session};
use mill_domain::tool::{ToolExecution, ToolSpec, ToolStatus};
use mill_domain::{Error, Result};

use crate::notify::{Notification, NotifyKind};
use crate::traits::{
    CompactionApply, CoordinationOps, IterationRecord, RegistryOps, RunFilter, RunOps,
    SessionOps, ToolDisposition, ToolOps,
};

const EVENT_BUFFER: usize = 1024;

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, Session>,
    /// Messages per session in insertion order (active and archived).
    messages: HashMap<Uuid, Vec<Message>>,
    agents: HashMap<Uuid, Agent>,
    tools: HashMap<String, ToolSpec>,
    runs: HashMap<Uuid, Run>,
    iterations: HashMap<Uuid, Vec<Iteration>>,
    tool_execs: HashMap<Uuid, ToolExecution>,
    instances: HashMap<Uuid, Instance>,
    leader: Option<LeaderLease>,
}

/// In-memory [`Store`](crate::Store) implementation.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Notification>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn notify(&self, kind: NotifyKind, id: Uuid, status: &str) {
        // No receivers is fine; waiters have a poll fallback anyway.
        let _ = self.events.send(Notification::new(kind, id, status));
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> Error {
    Error::NotFound {
        entity,
        id: id.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session ops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl SessionOps for MemoryStore {
    async fn create_session(&self, new: NewSession) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            identifier: new.identifier,
            parent_session_id: new.parent_session_id,
            metadata: new.metadata,
            compaction_count: 0,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.lock();
        inner.messages.insert(session.id, Vec::new());
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        self.inner
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("session", id))
    }

    async fn list_messages(
        &self,
        session_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<Message>> {
        let inner = self.inner.lock();
        let messages = inner
            .messages
            .get(&session_id)
            .ok_or_else(|| not_found("session", session_id))?;
        let mut out: Vec<Message> = messages
            .iter()
            .filter(|m| include_archived || !m.superseded)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.seq);
        Ok(out)
    }

    async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: Vec<ContentBlock>,
        token_count: i64,
    ) -> Result<Message> {
        let mut inner = self.inner.lock();
        let messages = inner
            .messages
            .get_mut(&session_id)
            .ok_or_else(|| not_found("session", session_id))?;
        let seq = messages.iter().map(|m| m.seq).max().unwrap_or(0) + 1;
        let message = Message {
            id: Uuid::new_v4(),
            session_id,
            seq,
            role,
            content,
            token_count,
            is_summary: false,
            superseded: false,
            created_at: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn apply_compaction(&self, session_id: Uuid, plan: CompactionApply) -> Result<Message> {
        let mut inner = self.inner.lock();
        let messages = inner
            .messages
            .get_mut(&session_id)
            .ok_or_else(|| not_found("session", session_id))?;

        for m in messages.iter_mut() {
            if !m.superseded && m.seq <= plan.archive_up_to_seq {
                m.superseded = true;
            }
        }
        let summary = Message {
            id: Uuid::new_v4(),
            session_id,
            seq: plan.summary_seq,
            role: Role::SystemSummary,
            content: plan.summary_content,
            token_count: plan.summary_tokens,
            is_summary: true,
            superseded: false,
            created_at: Utc::now(),
        };
        messages.push(summary.clone());

        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found("session", session_id))?;
        session.compaction_count += 1;
        Ok(summary)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry ops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn agent_from_definition(id: Uuid, created_at: DateTime<Utc>, def: AgentDefinition) -> Agent {
    Agent {
        id,
        name: def.name,
        model: def.model,
        system_prompt: def.system_prompt,
        max_tokens: def.max_tokens,
        temperature: def.temperature,
        tools: def.tools,
        agent_ids: def.agent_ids,
        config: def.config,
        created_at,
    }
}

#[async_trait::async_trait]
impl RegistryOps for MemoryStore {
    async fn upsert_agent(&self, def: AgentDefinition) -> Result<Agent> {
        let mut inner = self.inner.lock();
        let existing = inner.agents.values().find(|a| a.name == def.name);
        let (id, created_at) = match existing {
            Some(a) => (a.id, a.created_at),
            None => (Uuid::new_v4(), Utc::now()),
        };
        let agent = agent_from_definition(id, created_at, def);
        inner.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_or_create_agent(&self, def: AgentDefinition) -> Result<Agent> {
        {
            let inner = self.inner.lock();
            if let Some(a) = inner.agents.values().find(|a| a.name == def.name) {
                return Ok(a.clone());
            }
        }
        self.upsert_agent(def).await
    }

    async fn get_agent(&self, id: Uuid) -> Result<Agent> {
        self.inner
            .lock()
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("agent", id))
    }

    async fn get_agent_by_name(&self, name: &str) -> Result<Agent> {
        self.inner
            .lock()
            .agents
            .values()
            .find(|a| a.name == name)
            .cloned()
            .ok_or_else(|| not_found("agent", name))
    }

    async fn upsert_tool(&self, spec: &ToolSpec) -> Result<()> {
        self.inner
            .lock()
            .tools
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let mut tools: Vec<ToolSpec> = self.inner.lock().tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run ops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl RunOps for MemoryStore {
    async fn create_run(&self, new: NewRun) -> Result<Run> {
        let run = {
            let mut inner = self.inner.lock();
            if !inner.sessions.contains_key(&new.session_id) {
                return Err(not_found("session", new.session_id));
            }
            if !inner.agents.contains_key(&new.agent_id) {
                return Err(not_found("agent", new.agent_id));
            }
            let busy = inner
                .runs
                .values()
                .any(|r| r.session_id == new.session_id && !r.status.is_terminal());
            if busy {
                return Err(Error::Conflict(format!(
                    "session {} already has a non-terminal run",
                    new.session_id
                )));
            }
            let now = Utc::now();
            let run = Run {
                id: Uuid::new_v4(),
                session_id: new.session_id,
                agent_id: new.agent_id,
                parent_run_id: new.parent_run_id,
                input_prompt: new.input_prompt,
                variables: new.variables,
                status: RunStatus::Queued,
                attempt: 0,
                claimed_by: None,
                claimed_at: None,
                last_heartbeat_at: None,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
            };
            inner.iterations.insert(run.id, Vec::new());
            inner.runs.insert(run.id, run.clone());
            run
        };
        self.notify(NotifyKind::RunReady, run.id, "queued");
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.inner
            .lock()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("run", id))
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        let inner = self.inner.lock();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| filter.session_id.map_or(true, |s| r.session_id == s))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        if filter.limit > 0 {
            runs.truncate(filter.limit as usize);
        }
        Ok(runs)
    }

    async fn list_child_runs(&self, parent_run_id: Uuid) -> Result<Vec<Run>> {
        let inner = self.inner.lock();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.parent_run_id == Some(parent_run_id))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn claim_run(&self, instance_id: Uuid) -> Result<Option<Run>> {
        let mut inner = self.inner.lock();
        let candidate = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Queued && r.claimed_by.is_none())
            .min_by_key(|r| r.created_at)
            .map(|r| r.id);
        let Some(id) = candidate else {
            return Ok(None);
        };
        let now = Utc::now();
        let run = inner.runs.get_mut(&id).expect("candidate exists");
        run.status = RunStatus::Running;
        run.claimed_by = Some(instance_id);
        run.claimed_at = Some(now);
        run.last_heartbeat_at = Some(now);
        run.updated_at = now;
        Ok(Some(run.clone()))
    }

    async fn heartbeat_run(&self, run_id: Uuid, instance_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("run", run_id))?;
        let owned = run.claimed_by == Some(instance_id)
            && matches!(
                run.status,
                RunStatus::Running | RunStatus::WaitingForTools
            );
        if !owned {
            return Err(Error::LostClaim);
        }
        run.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn record_iteration(
        &self,
        run_id: Uuid,
        instance_id: Uuid,
        rec: IterationRecord,
    ) -> Result<Iteration> {
        let (iteration, notifications) = {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get(&run_id)
                .ok_or_else(|| not_found("run", run_id))?;
            if run.claimed_by != Some(instance_id) || run.status != RunStatus::Running {
                return Err(Error::LostClaim);
            }
            let session_id = run.session_id;

            // Assistant message.
            let token_count = if rec.usage.output_tokens > 0 {
                rec.usage.output_tokens
            } else {
                estimate_tokens(&rec.assistant_content)
            };
            let text = rec
                .assistant_content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            let messages = inner
                .messages
                .get_mut(&session_id)
                .ok_or_else(|| not_found("session", session_id))?;
            let seq = messages.iter().map(|m| m.seq).max().unwrap_or(0) + 1;
            messages.push(Message {
                id: Uuid::new_v4(),
                session_id,
                seq,
                role: Role::Assistant,
                content: rec.assistant_content.clone(),
                token_count,
                is_summary: false,
                superseded: false,
                created_at: Utc::now(),
            });

            // Iteration row.
            let iterations = inner.iterations.entry(run_id).or_default();
            let iter_seq = iterations.iter().map(|i| i.seq).max().unwrap_or(0) + 1;
            let iteration = Iteration {
                id: Uuid::new_v4(),
                run_id,
                seq: iter_seq,
                input_token_count: rec.usage.input_tokens,
                output_token_count: rec.usage.output_tokens,
                stop_reason: rec.stop_reason,
                started_at: rec.started_at,
                finished_at: rec.finished_at,
            };
            iterations.push(iteration.clone());

            let mut notifications = Vec::new();
            let now = Utc::now();
            if rec.tool_calls.is_empty() {
                let run = inner.runs.get_mut(&run_id).expect("checked above");
                run.status = RunStatus::Completed;
                run.result = Some(text);
                run.claimed_by = None;
                run.updated_at = now;
                notifications.push(Notification::new(
                    NotifyKind::RunCompleted,
                    run_id,
                    "completed",
                ));
            } else {
                for (ord, call) in rec.tool_calls.iter().enumerate() {
                    let te = ToolExecution {
                        id: Uuid::new_v4(),
                        run_id,
                        iteration_id: iteration.id,
                        tool_use_id: call.tool_use_id.clone(),
                        tool_name: call.tool_name.clone(),
                        kind: call.kind,
                        ord: ord as i32,
                        input: call.input.clone(),
                        status: ToolStatus::Queued,
                        attempt: 1,
                        max_attempts: rec.max_attempts,
                        claimed_by: None,
                        claimed_at: None,
                        last_heartbeat_at: None,
                        available_at: now,
                        output: None,
                        error: None,
                        created_at: now,
                        updated_at: now,
                    };
                    notifications.push(Notification::new(NotifyKind::ToolReady, te.id, "queued"));
                    inner.tool_execs.insert(te.id, te);
                }
                let run = inner.runs.get_mut(&run_id).expect("checked above");
                run.status = RunStatus::WaitingForTools;
                run.updated_at = now;
            }
            (iteration, notifications)
        };
        for n in notifications {
            let _ = self.events.send(n);
        }
        Ok(iteration)
    }

    async fn resume_run(&self, run_id: Uuid, instance_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("run", run_id))?;
        if run.claimed_by != Some(instance_id) || run.status != RunStatus::WaitingForTools {
            return Err(Error::LostClaim);
        }
        run.status = RunStatus::Running;
        run.last_heartbeat_at = Some(Utc::now());
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        instance_id: Option<Uuid>,
        error: RunError,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| not_found("run", run_id))?;
            if run.status.is_terminal() {
                return Err(Error::Conflict("run already terminal".into()));
            }
            if let Some(me) = instance_id {
                if run.claimed_by != Some(me) {
                    return Err(Error::LostClaim);
                }
            }
            run.status = RunStatus::Failed;
            run.error = Some(error);
            run.claimed_by = None;
            run.updated_at = Utc::now();
        }
        self.notify(NotifyKind::RunCompleted, run_id, "failed");
        Ok(())
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| not_found("run", run_id))?;
            if run.status.is_terminal() {
                return Ok(());
            }
            run.status = RunStatus::Cancelled;
            run.claimed_by = None;
            run.updated_at = Utc::now();
        }
        self.notify(NotifyKind::RunCompleted, run_id, "cancelled");
        Ok(())
    }

    async fn requeue_run(&self, run_id: Uuid) -> Result<()> {
        let requeued = {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| not_found("run", run_id))?;
            if !matches!(
                run.status,
                RunStatus::Running | RunStatus::WaitingForTools
            ) {
                false
            } else {
                run.status = RunStatus::Queued;
                run.claimed_by = None;
                run.claimed_at = None;
                run.last_heartbeat_at = None;
                run.attempt += 1;
                run.updated_at = Utc::now();
                true
            }
        };
        if requeued {
            self.notify(NotifyKind::RunReady, run_id, "queued");
        }
        Ok(())
    }

    async fn find_stuck_runs(&self, before: DateTime<Utc>) -> Result<Vec<Run>> {
        let inner = self.inner.lock();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    RunStatus::Running | RunStatus::WaitingForTools
                ) && r.last_heartbeat_at.map_or(true, |hb| hb < before)
            })
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn list_iterations(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        let inner = self.inner.lock();
        Ok(inner.iterations.get(&run_id).cloned().unwrap_or_default())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool ops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ToolOps for MemoryStore {
    async fn claim_tool_execution(&self, instance_id: Uuid) -> Result<Option<ToolExecution>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let candidate = inner
            .tool_execs
            .values()
            .filter(|t| t.status.is_claimable() && t.available_at <= now)
            .min_by_key(|t| (t.available_at, t.created_at, t.ord))
            .map(|t| t.id);
        let Some(id) = candidate else {
            return Ok(None);
        };
        let te = inner.tool_execs.get_mut(&id).expect("candidate exists");
        te.status = ToolStatus::Running;
        te.claimed_by = Some(instance_id);
        te.claimed_at = Some(now);
        te.last_heartbeat_at = Some(now);
        te.updated_at = now;
        Ok(Some(te.clone()))
    }

    async fn get_tool_execution(&self, te_id: Uuid) -> Result<ToolExecution> {
        self.inner
            .lock()
            .tool_execs
            .get(&te_id)
            .cloned()
            .ok_or_else(|| not_found("tool execution", te_id))
    }

    async fn heartbeat_tool_execution(&self, te_id: Uuid, instance_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let te = inner
            .tool_execs
            .get_mut(&te_id)
            .ok_or_else(|| not_found("tool execution", te_id))?;
        if te.claimed_by != Some(instance_id) || te.status != ToolStatus::Running {
            return Err(Error::LostClaim);
        }
        te.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn complete_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        output: serde_json::Value,
    ) -> Result<()> {
        let run_id = {
            let mut inner = self.inner.lock();
            let te = inner
                .tool_execs
                .get_mut(&te_id)
                .ok_or_else(|| not_found("tool execution", te_id))?;
            if te.claimed_by != Some(instance_id) || te.status != ToolStatus::Running {
                return Err(Error::LostClaim);
            }
            te.status = ToolStatus::Succeeded;
            te.output = Some(output);
            te.claimed_by = None;
            te.updated_at = Utc::now();
            te.run_id
        };
        self.notify(NotifyKind::ToolCompleted, run_id, "succeeded");
        Ok(())
    }

    async fn fail_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        disposition: ToolDisposition,
    ) -> Result<()> {
        let (run_id, status, reready) = {
            let mut inner = self.inner.lock();
            let te = inner
                .tool_execs
                .get_mut(&te_id)
                .ok_or_else(|| not_found("tool execution", te_id))?;
            if te.claimed_by != Some(instance_id) || te.status != ToolStatus::Running {
                return Err(Error::LostClaim);
            }
            let mut reready = false;
            match disposition {
                ToolDisposition::Failed { error } => {
                    te.status = ToolStatus::Failed;
                    te.error = Some(error);
                }
                ToolDisposition::Cancelled { error } => {
                    te.status = ToolStatus::Cancelled;
                    te.error = Some(error);
                }
                ToolDisposition::Discarded { error } => {
                    te.status = ToolStatus::Discarded;
                    te.error = Some(error);
                }
                ToolDisposition::Retry {
                    error,
                    available_at,
                } => {
                    te.status = ToolStatus::Queued;
                    te.attempt += 1;
                    te.error = Some(error);
                    te.available_at = available_at;
                    reready = true;
                }
                ToolDisposition::Snoozed {
                    error,
                    available_at,
                } => {
                    te.status = ToolStatus::Snoozed;
                    te.error = Some(error);
                    te.available_at = available_at;
                    reready = true;
                }
            }
            te.claimed_by = None;
            te.claimed_at = None;
            te.updated_at = Utc::now();
            (te.run_id, te.status, reready)
        };
        self.notify(NotifyKind::ToolCompleted, run_id, status.as_str());
        if reready {
            self.notify(NotifyKind::ToolReady, te_id, status.as_str());
        }
        Ok(())
    }

    async fn release_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let te = inner
                .tool_execs
                .get_mut(&te_id)
                .ok_or_else(|| not_found("tool execution", te_id))?;
            if te.claimed_by != Some(instance_id) || te.status != ToolStatus::Running {
                return Err(Error::LostClaim);
            }
            te.status = ToolStatus::Queued;
            te.claimed_by = None;
            te.claimed_at = None;
            te.available_at = available_at;
            te.updated_at = Utc::now();
        }
        self.notify(NotifyKind::ToolReady, te_id, "queued");
        Ok(())
    }

    async fn list_tool_executions(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>> {
        let inner = self.inner.lock();
        let mut execs: Vec<ToolExecution> = inner
            .tool_execs
            .values()
            .filter(|t| t.iteration_id == iteration_id)
            .cloned()
            .collect();
        execs.sort_by_key(|t| t.ord);
        Ok(execs)
    }

    async fn find_stuck_tool_executions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ToolExecution>> {
        let inner = self.inner.lock();
        let mut execs: Vec<ToolExecution> = inner
            .tool_execs
            .values()
            .filter(|t| {
                t.status == ToolStatus::Running
                    && t.last_heartbeat_at.map_or(true, |hb| hb < before)
            })
            .cloned()
            .collect();
        execs.sort_by_key(|t| t.created_at);
        Ok(execs)
    }

    async fn requeue_tool_execution(&self, te_id: Uuid) -> Result<()> {
        let requeued = {
            let mut inner = self.inner.lock();
            let te = inner
                .tool_execs
                .get_mut(&te_id)
                .ok_or_else(|| not_found("tool execution", te_id))?;
            if te.status != ToolStatus::Running {
                false
            } else {
                te.status = ToolStatus::Queued;
                te.claimed_by = None;
                te.claimed_at = None;
                te.last_heartbeat_at = None;
                te.available_at = Utc::now();
                // The abandoned attempt counts as consumed.
                te.attempt += 1;
                te.updated_at = Utc::now();
                true
            }
        };
        if requeued {
            self.notify(NotifyKind::ToolReady, te_id, "queued");
        }
        Ok(())
    }

    async fn fail_tool_rescued(&self, te_id: Uuid, error: String) -> Result<()> {
        let run_id = {
            let mut inner = self.inner.lock();
            let te = inner
                .tool_execs
                .get_mut(&te_id)
                .ok_or_else(|| not_found("tool execution", te_id))?;
            if te.status.is_terminal() {
                return Ok(());
            }
            te.status = ToolStatus::Failed;
            te.error = Some(error);
            te.claimed_by = None;
            te.updated_at = Utc::now();
            te.run_id
        };
        self.notify(NotifyKind::ToolCompleted, run_id, "failed");
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordination ops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl CoordinationOps for MemoryStore {
    async fn register_instance(&self, instance: &Instance) -> Result<()> {
        self.inner
            .lock()
            .instances
            .insert(instance.id, instance.clone());
        self.notify(NotifyKind::InstanceEvent, instance.id, "registered");
        Ok(())
    }

    async fn refresh_instance(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.instances.get_mut(&id) {
            Some(inst) => {
                inst.last_heartbeat_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_instance(&self, id: Uuid) -> Result<()> {
        self.inner.lock().instances.remove(&id);
        self.notify(NotifyKind::InstanceEvent, id, "removed");
        Ok(())
    }

    async fn delete_stale_instances(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let len_before = inner.instances.len();
        inner.instances.retain(|_, i| i.last_heartbeat_at >= before);
        Ok((len_before - inner.instances.len()) as u64)
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut out: Vec<Instance> = self.inner.lock().instances.values().cloned().collect();
        out.sort_by_key(|i| i.started_at);
        Ok(out)
    }

    async fn try_acquire_leader(&self, instance_id: Uuid, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let takeable = match &inner.leader {
            None => true,
            Some(lease) => lease.expires_at < now || lease.instance_id == instance_id,
        };
        if takeable {
            inner.leader = Some(LeaderLease {
                instance_id,
                acquired_at: now,
                expires_at,
            });
        }
        Ok(takeable)
    }

    async fn renew_leader(&self, instance_id: Uuid, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        match inner.leader.as_mut() {
            Some(lease) if lease.instance_id == instance_id => {
                lease.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_leader(&self, instance_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .leader
            .as_ref()
            .is_some_and(|l| l.instance_id == instance_id)
        {
            inner.leader = None;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }
}
