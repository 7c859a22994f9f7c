//! Tool worker: claims queued executions, runs the registered handler (or
//! delegates to a sub-agent), and applies the retry policy.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::Instrument;

use mill_domain::retry::retry_delay;
use mill_domain::run::RunStatus;
use mill_domain::schema;
use mill_domain::session::NewSession;
use mill_domain::tool::{ToolContext, ToolError, ToolExecution, ToolKind};
use mill_domain::run::NewRun;
use mill_domain::{Error, Result};
use mill_store::{NotifyKind, Store, ToolDisposition};

use super::{spawn_row_heartbeat, WorkerCtx};

/// How long an execution for a tool this instance does not have stays
/// un-claimable, so a mismatched fleet does not spin claims.
const UNREGISTERED_RELEASE_DELAY: Duration = Duration::from_millis(250);

pub(crate) async fn tool_worker_loop<S: Store>(
    ctx: Arc<WorkerCtx<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut wake = ctx.subscribe(
        NotifyKind::ToolReady,
        None,
        ctx.config.tool_poll_interval,
    );

    loop {
        if *shutdown.borrow() {
            return;
        }
        match ctx.store.claim_tool_execution(ctx.instance_id).await {
            Ok(Some(te)) => {
                let span = tracing::info_span!(
                    "tool_execution",
                    tool_execution_id = %te.id,
                    tool = %te.tool_name,
                    run_id = %te.run_id,
                    attempt = te.attempt,
                );
                let outcome = execute_claimed(&ctx, te).instrument(span).await;
                if let Err(e) = outcome {
                    match e {
                        // The row was rescued out from under us; rescue or
                        // another worker owns the outcome now.
                        Error::LostClaim => {}
                        e => {
                            tracing::warn!(error = %e, "tool execution bookkeeping failed");
                            ctx.config.report_error(&e);
                        }
                    }
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = wake.wait() => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "tool claim failed");
                ctx.config.report_error(&e);
                tokio::time::sleep(ctx.config.tool_poll_interval).await;
            }
        }
    }
}

async fn execute_claimed<S: Store>(ctx: &Arc<WorkerCtx<S>>, te: ToolExecution) -> Result<()> {
    let store = ctx.store.clone();
    let instance_id = ctx.instance_id;
    let te_id = te.id;
    let (lost, heartbeat) = spawn_row_heartbeat(ctx.config.heartbeat_interval, move || {
        let store = store.clone();
        async move { store.heartbeat_tool_execution(te_id, instance_id).await }
    });

    let result = execute_inner(ctx, &te, &lost).await;
    heartbeat.abort();
    result
}

async fn execute_inner<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    te: &ToolExecution,
    lost: &std::sync::atomic::AtomicBool,
) -> Result<()> {
    let run = ctx.store.get_run(te.run_id).await?;
    // The run may have been cancelled while this execution sat queued;
    // executing its tools would be wasted (or harmful) work.
    if run.status.is_terminal() {
        return ctx
            .store
            .fail_tool_execution(
                te.id,
                ctx.instance_id,
                ToolDisposition::Cancelled {
                    error: format!("run is {}", run.status.as_str()),
                },
            )
            .await;
    }

    match te.kind {
        ToolKind::Agent => delegate_to_agent(ctx, te, &run, lost).await,
        ToolKind::Tool => invoke_handler(ctx, te, &run).await,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registered tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn invoke_handler<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    te: &ToolExecution,
    run: &mill_domain::run::Run,
) -> Result<()> {
    let Some(handler) = ctx.registry.get(&te.tool_name) else {
        // Not registered on this instance; hand the claim back so another
        // instance may take it.
        tracing::debug!(tool = %te.tool_name, "tool not registered here, releasing claim");
        let available_at = Utc::now()
            + chrono::Duration::from_std(UNREGISTERED_RELEASE_DELAY)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(250));
        return ctx
            .store
            .release_tool_execution(te.id, ctx.instance_id, available_at)
            .await;
    };

    let spec = handler.spec();
    if let Err(violations) = schema::validate(&spec.input_schema, &te.input) {
        return ctx
            .store
            .fail_tool_execution(
                te.id,
                ctx.instance_id,
                ToolDisposition::Discarded {
                    error: format!("input schema violation: {}", violations.join("; ")),
                },
            )
            .await;
    }

    let tool_ctx = ToolContext {
        run_id: run.id,
        session_id: run.session_id,
        variables: run.variables.clone(),
    };
    let outcome = handler.invoke(tool_ctx, te.input.clone()).await;
    settle(ctx, te, outcome).await
}

/// Map a handler outcome onto the persisted transition.
async fn settle<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    te: &ToolExecution,
    outcome: std::result::Result<serde_json::Value, ToolError>,
) -> Result<()> {
    match outcome {
        Ok(output) => {
            ctx.store
                .complete_tool_execution(te.id, ctx.instance_id, output)
                .await
        }
        Err(ToolError::Cancel(message)) => {
            ctx.store
                .fail_tool_execution(
                    te.id,
                    ctx.instance_id,
                    ToolDisposition::Cancelled { error: message },
                )
                .await
        }
        Err(ToolError::Discard(message)) => {
            ctx.store
                .fail_tool_execution(
                    te.id,
                    ctx.instance_id,
                    ToolDisposition::Discarded { error: message },
                )
                .await
        }
        Err(ToolError::Snooze { delay, reason }) => {
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            ctx.store
                .fail_tool_execution(
                    te.id,
                    ctx.instance_id,
                    ToolDisposition::Snoozed {
                        error: reason,
                        available_at,
                    },
                )
                .await
        }
        Err(ToolError::Fail(message)) => {
            let disposition = if te.attempt < te.max_attempts {
                let delay = retry_delay(te.attempt, &ctx.config.tool_retry);
                ToolDisposition::Retry {
                    error: message,
                    available_at: Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                }
            } else {
                ToolDisposition::Failed { error: message }
            };
            ctx.store
                .fail_tool_execution(te.id, ctx.instance_id, disposition)
                .await
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agent delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool_use naming a sub-agent: create a child run in a dedicated child
/// session and await it like any other tool.
async fn delegate_to_agent<S: Store>(
    ctx: &Arc<WorkerCtx<S>>,
    te: &ToolExecution,
    parent: &mill_domain::run::Run,
    lost: &std::sync::atomic::AtomicBool,
) -> Result<()> {
    let agent = match ctx.store.get_agent_by_name(&te.tool_name).await {
        Ok(agent) => agent,
        Err(Error::NotFound { .. }) => {
            return settle(
                ctx,
                te,
                Err(ToolError::Discard(format!(
                    "delegated agent {:?} does not exist",
                    te.tool_name
                ))),
            )
            .await;
        }
        Err(e) => return Err(e),
    };

    let Some(prompt) = te.input.get("prompt").and_then(|v| v.as_str()) else {
        return settle(
            ctx,
            te,
            Err(ToolError::Discard("delegation input has no prompt".into())),
        )
        .await;
    };

    let parent_session = ctx.store.get_session(parent.session_id).await?;
    let child_session = ctx
        .store
        .create_session(NewSession {
            tenant_id: parent_session.tenant_id,
            identifier: format!("delegate:{}", te.id),
            parent_session_id: Some(parent.session_id),
            metadata: serde_json::Value::Null,
        })
        .await?;

    let mut new_run = NewRun::new(child_session.id, agent.id, prompt);
    new_run.parent_run_id = Some(parent.id);
    new_run.variables = parent.variables.clone();
    let child = ctx.store.create_run(new_run).await?;
    tracing::info!(
        child_run_id = %child.id,
        agent = %agent.name,
        "delegated to sub-agent"
    );

    // Await the child like any other tool; our own heartbeat keeps this
    // execution from being rescued meanwhile.
    let mut sub = ctx.subscribe(
        NotifyKind::RunCompleted,
        Some(child.id),
        ctx.config.poll_fallback_interval,
    );
    let terminal = loop {
        if lost.load(Ordering::Acquire) {
            return Err(Error::LostClaim);
        }
        let current = ctx.store.get_run(child.id).await?;
        if current.status.is_terminal() {
            break current;
        }
        sub.wait().await;
    };

    let outcome = match terminal.status {
        RunStatus::Completed => Ok(serde_json::Value::String(
            terminal.result.unwrap_or_default(),
        )),
        RunStatus::Cancelled => Err(ToolError::Cancel("delegated run was cancelled".into())),
        _ => {
            let message = terminal
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "delegated run failed".into());
            Err(ToolError::Fail(message))
        }
    };
    settle(ctx, te, outcome).await
}
