//! Run worker: drives a claimed run through its state machine — model call,
//! tool dispatch, tool-result injection — until terminal or abandoned.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::Instrument;

use mill_domain::agent::Agent;
use mill_domain::message::{estimate_tokens, text_content, ContentBlock, Role};
use mill_domain::model::{AssembledMessage, ModelRequest, StopReason, Turn};
use mill_domain::run::{Run, RunError, RunStatus};
use mill_domain::tool::{ToolCallSpec, ToolExecution, ToolKind, ToolSpec};
use mill_domain::{Error, ErrorKind, Result};
use mill_store::{IterationRecord, NotifyKind, Store};

use super::{spawn_row_heartbeat, WorkerCtx};
use crate::assemble::consume_stream;
use crate::compact;

pub(crate) async fn run_worker_loop<S: Store>(
    ctx: Arc<WorkerCtx<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut wake = ctx.subscribe(NotifyKind::RunReady, None, ctx.config.run_poll_interval);

    loop {
        if *shutdown.borrow() {
            return;
        }
        match ctx.store.claim_run(ctx.instance_id).await {
            Ok(Some(run)) => {
                drive_run(&ctx, run, &shutdown).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = wake.wait() => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "run claim failed");
                ctx.config.report_error(&e);
                tokio::time::sleep(ctx.config.run_poll_interval).await;
            }
        }
    }
}

/// Drive one claimed run. Failures are classified: lost claims and
/// cancellations are abandoned silently, everything else fails the run.
async fn drive_run<S: Store>(ctx: &Arc<WorkerCtx<S>>, run: Run, shutdown: &watch::Receiver<bool>) {
    let span = tracing::info_span!(
        "run",
        run_id = %run.id,
        session_id = %run.session_id,
        attempt = run.attempt,
    );
    drive_run_instrumented(ctx, run, shutdown)
        .instrument(span)
        .await
}

async fn drive_run_instrumented<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    run: Run,
    shutdown: &watch::Receiver<bool>,
) {
    let store = ctx.store.clone();
    let instance_id = ctx.instance_id;
    let run_id = run.id;
    let (lost, heartbeat) = spawn_row_heartbeat(ctx.config.heartbeat_interval, move || {
        let store = store.clone();
        async move { store.heartbeat_run(run_id, instance_id).await }
    });

    let result = drive_run_inner(ctx, &run, &lost, shutdown).await;
    heartbeat.abort();

    match result {
        Ok(()) => {}
        Err(Error::LostClaim) => {
            tracing::debug!("claim lost, abandoning run");
        }
        Err(Error::Cancelled) => {
            tracing::debug!("run cancelled, aborting");
        }
        Err(e) => {
            tracing::warn!(error = %e, "run failed");
            ctx.config.report_error(&e);
            let error = RunError::new(e.kind(), e.to_string());
            match ctx.store.fail_run(run.id, Some(ctx.instance_id), error).await {
                Ok(()) | Err(Error::LostClaim) => {}
                Err(write_err) => {
                    tracing::warn!(error = %write_err, "failed to persist run failure");
                    ctx.config.report_error(&write_err);
                }
            }
        }
    }
}

async fn drive_run_inner<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    run: &Run,
    lost: &AtomicBool,
    shutdown: &watch::Receiver<bool>,
) -> Result<()> {
    let agent = ctx.store.get_agent(run.agent_id).await?;
    let sub_agents = load_sub_agents(ctx, &agent).await?;
    let tool_specs = build_tool_specs(ctx, &agent, &sub_agents).await?;
    let sub_agent_names: HashSet<String> =
        sub_agents.iter().map(|a| a.name.clone()).collect();

    // First claim: seed the user message. Re-claim after rescue: pick up
    // the pending tool gate of the last iteration instead.
    let iterations = ctx.store.list_iterations(run.id).await?;
    match iterations.last() {
        None => seed_user_message(ctx, run).await?,
        Some(last) => {
            let execs = ctx.store.list_tool_executions(last.id).await?;
            if !execs.is_empty() {
                let execs = wait_for_tool_gate(ctx, run, last.id, lost).await?;
                inject_tool_results(ctx, run, &execs).await?;
            }
        }
    }

    loop {
        if lost.load(Ordering::Acquire) {
            return Err(Error::LostClaim);
        }
        if *shutdown.borrow() {
            // Give the run back immediately instead of waiting for rescue.
            tracing::info!("shutting down, requeueing in-flight run");
            return ctx.store.requeue_run(run.id).await;
        }
        let current = ctx.store.get_run(run.id).await?;
        match current.status {
            RunStatus::Running => {}
            RunStatus::Cancelled => return Err(Error::Cancelled),
            _ => return Err(Error::LostClaim),
        }

        // Compaction between iterations. A failed compaction leaves the
        // window unchanged; continue with full history.
        if agent.config.auto_compaction {
            match compact::maybe_compact(
                ctx.store.as_ref(),
                ctx.model.as_ref(),
                &agent,
                run.session_id,
            )
            .await
            {
                Ok(outcome) => {
                    if outcome.strategy != compact::CompactionStrategy::NoOp {
                        if let Some(hook) = &ctx.config.on_compaction {
                            hook(&outcome);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "compaction failed, continuing uncompacted");
                    ctx.config.report_error(&e);
                }
            }
        }

        let messages = ctx.store.list_messages(run.session_id, false).await?;
        let request = ModelRequest {
            model: agent.model.clone(),
            system: agent.system_prompt.clone(),
            messages: messages
                .iter()
                .map(|m| Turn {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect(),
            tools: tool_specs.clone(),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            stop_sequences: Vec::new(),
            extended_context: agent.config.extended_context,
        };

        let started_at = Utc::now();
        let assembled = call_model_with_retry(ctx, request, lost).await?;

        // A response truncated inside a tool_use block cannot be executed;
        // the partial input is not a valid call.
        if assembled.stop_reason == StopReason::MaxTokens && assembled.has_tool_use() {
            return Err(Error::Permanent(
                "model hit max_tokens inside a tool_use block".into(),
            ));
        }

        let tool_calls: Vec<ToolCallSpec> = assembled
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCallSpec {
                    tool_use_id: id.clone(),
                    tool_name: name.clone(),
                    kind: if sub_agent_names.contains(name) {
                        ToolKind::Agent
                    } else {
                        ToolKind::Tool
                    },
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect();
        let had_tools = !tool_calls.is_empty();

        let iteration = ctx
            .store
            .record_iteration(
                run.id,
                ctx.instance_id,
                IterationRecord {
                    assistant_content: assembled.content.clone(),
                    usage: assembled.usage,
                    stop_reason: assembled.stop_reason,
                    started_at,
                    finished_at: Utc::now(),
                    tool_calls,
                    max_attempts: ctx.config.tool_retry.max_attempts,
                },
            )
            .await?;
        tracing::debug!(
            iteration = iteration.seq,
            stop_reason = ?assembled.stop_reason,
            tool_calls = had_tools,
            "iteration recorded"
        );

        if !had_tools {
            // record_iteration marked the run completed.
            return Ok(());
        }

        let execs = wait_for_tool_gate(ctx, run, iteration.id, lost).await?;
        inject_tool_results(ctx, run, &execs).await?;

        let current = ctx.store.get_run(run.id).await?;
        if current.status == RunStatus::WaitingForTools {
            ctx.store.resume_run(run.id, ctx.instance_id).await?;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request preparation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn load_sub_agents<S: Store>(ctx: &Arc<WorkerCtx<S>>, agent: &Agent) -> Result<Vec<Agent>> {
    let mut sub_agents = Vec::with_capacity(agent.agent_ids.len());
    for id in &agent.agent_ids {
        match ctx.store.get_agent(*id).await {
            Ok(a) => sub_agents.push(a),
            Err(Error::NotFound { .. }) => {
                return Err(Error::Permanent(format!(
                    "agent {:?} delegates to unknown agent {id}",
                    agent.name
                )));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(sub_agents)
}

/// Concrete tool schemas plus one tool-projection per sub-agent.
async fn build_tool_specs<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    agent: &Agent,
    sub_agents: &[Agent],
) -> Result<Vec<ToolSpec>> {
    let registered = ctx.store.list_tools().await?;
    let mut specs = Vec::new();
    for name in &agent.tools {
        match registered.iter().find(|t| &t.name == name) {
            Some(spec) => specs.push(spec.clone()),
            None => {
                // Tolerate drift: the agent definition may be ahead of the
                // fleet's registrations.
                tracing::warn!(tool = %name, agent = %agent.name, "agent tool not registered, skipping");
            }
        }
    }
    for sub in sub_agents {
        specs.push(agent_projection(sub));
    }
    Ok(specs)
}

/// How a delegable sub-agent appears to the model: a tool taking a prompt.
fn agent_projection(agent: &Agent) -> ToolSpec {
    let description = if agent.system_prompt.is_empty() {
        format!("Delegate a task to the {} agent.", agent.name)
    } else {
        let prompt_head: String = agent.system_prompt.chars().take(200).collect();
        format!("Delegate a task to the {} agent. {}", agent.name, prompt_head)
    };
    ToolSpec {
        name: agent.name.clone(),
        description,
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the delegated agent."
                }
            },
            "required": ["prompt"]
        }),
    }
}

async fn seed_user_message<S: Store>(ctx: &Arc<WorkerCtx<S>>, run: &Run) -> Result<()> {
    let messages = ctx.store.list_messages(run.session_id, false).await?;
    let already_seeded = messages
        .last()
        .is_some_and(|m| m.role == Role::User && m.text() == run.input_prompt);
    if already_seeded {
        return Ok(());
    }
    let content = text_content(run.input_prompt.clone());
    let tokens = estimate_tokens(&content);
    ctx.store
        .append_message(run.session_id, Role::User, content, tokens)
        .await?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model call with retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MODEL_RETRY_BASE: Duration = Duration::from_millis(500);
const MODEL_RETRY_CAP: Duration = Duration::from_secs(30);

/// Call the endpoint, retrying transient and rate-limited failures with
/// backoff until the stuck-run timeout would pass.
async fn call_model_with_retry<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    request: ModelRequest,
    lost: &AtomicBool,
) -> Result<AssembledMessage> {
    let deadline = tokio::time::Instant::now() + ctx.config.stuck_run_timeout;
    let mut attempt: u32 = 0;

    loop {
        if lost.load(Ordering::Acquire) {
            return Err(Error::LostClaim);
        }

        let result = async {
            let stream = ctx.model.stream(request.clone()).await?;
            consume_stream(stream, || lost.load(Ordering::Acquire)).await
        }
        .await;

        let error = match result {
            Ok(assembled) => return Ok(assembled),
            Err(e) => e,
        };

        let delay = match error.kind() {
            ErrorKind::Transient => exponential(MODEL_RETRY_BASE, attempt),
            ErrorKind::RateLimited => match &error {
                Error::Model {
                    retry_after: Some(after),
                    ..
                } => *after,
                _ => exponential(Duration::from_secs(1), attempt),
            },
            _ => return Err(error),
        };

        if tokio::time::Instant::now() + delay >= deadline {
            return Err(error);
        }
        attempt += 1;
        tracing::warn!(
            error = %error,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "model call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

fn exponential(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(MODEL_RETRY_CAP)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Block until every execution of the iteration is terminal. Re-reads the
/// database on every hint and at least once per poll interval, and watches
/// for cancellation.
async fn wait_for_tool_gate<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    run: &Run,
    iteration_id: uuid::Uuid,
    lost: &AtomicBool,
) -> Result<Vec<ToolExecution>> {
    let mut sub = ctx.subscribe(
        NotifyKind::ToolCompleted,
        Some(run.id),
        ctx.config.poll_fallback_interval,
    );
    loop {
        if lost.load(Ordering::Acquire) {
            return Err(Error::LostClaim);
        }
        let current = ctx.store.get_run(run.id).await?;
        if current.status == RunStatus::Cancelled {
            return Err(Error::Cancelled);
        }

        let execs = ctx.store.list_tool_executions(iteration_id).await?;
        if !execs.is_empty() && execs.iter().all(|t| t.status.is_terminal()) {
            return Ok(execs);
        }
        sub.wait().await;
    }
}

/// Append one tool_result message per execution, in tool_use order —
/// never completion order. Skips results already present (rescue replay).
async fn inject_tool_results<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    run: &Run,
    execs: &[ToolExecution],
) -> Result<()> {
    let messages = ctx.store.list_messages(run.session_id, false).await?;
    let injected: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::ToolResult)
        .flat_map(|m| {
            m.content.iter().filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
        })
        .collect();

    let mut ordered: Vec<&ToolExecution> = execs.iter().collect();
    ordered.sort_by_key(|t| t.ord);

    for te in ordered {
        if injected.contains(&te.tool_use_id) {
            continue;
        }
        let (text, is_error) = result_text(te);
        let content = vec![ContentBlock::ToolResult {
            tool_use_id: te.tool_use_id.clone(),
            content: text,
            is_error,
        }];
        let tokens = estimate_tokens(&content);
        ctx.store
            .append_message(run.session_id, Role::ToolResult, content, tokens)
            .await?;
    }
    Ok(())
}

fn result_text(te: &ToolExecution) -> (String, bool) {
    use mill_domain::tool::ToolStatus;
    match te.status {
        ToolStatus::Succeeded => {
            let text = match &te.output {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => String::new(),
            };
            (text, false)
        }
        _ => {
            let text = te
                .error
                .clone()
                .unwrap_or_else(|| format!("tool {}", te.status.as_str()));
            (text, true)
        }
    }
}
