//! End-to-end scenarios: a full client (worker pools, leader, rescue)
//! against the in-process store and a scripted model.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mill_client::testing::ScriptedModel;
use mill_client::{Client, Config};
use mill_domain::agent::{AgentConfig, AgentDefinition};
use mill_domain::message::{ContentBlock, Role};
use mill_domain::model::StopReason;
use mill_domain::retry::ToolRetryConfig;
use mill_domain::run::RunStatus;
use mill_domain::session::NewSession;
use mill_domain::tool::{ToolContext, ToolError, ToolHandler, ToolSpec, ToolStatus};
use mill_domain::Error;
use mill_store::{MemoryStore, RegistryOps, RunOps, SessionOps, ToolOps};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(50),
        leader_ttl: Duration::from_millis(200),
        stuck_run_timeout: Duration::from_secs(5),
        run_poll_interval: Duration::from_millis(20),
        tool_poll_interval: Duration::from_millis(20),
        poll_fallback_interval: Duration::from_millis(20),
        cleanup_interval: Duration::from_millis(50),
        max_concurrent_runs: 2,
        max_concurrent_tools: 4,
        ..Config::default()
    }
}

async fn new_session(client: &Client<MemoryStore>) -> uuid::Uuid {
    client
        .create_session(NewSession {
            tenant_id: "default".into(),
            identifier: "test".into(),
            parent_session_id: None,
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap()
        .id
}

fn object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

// ── Tools ──────────────────────────────────────────────────────────

/// Returns a fixed value, optionally after a delay.
struct StaticTool {
    name: &'static str,
    delay: Duration,
    output: serde_json::Value,
}

#[async_trait::async_trait]
impl ToolHandler for StaticTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.into(),
            description: "returns a fixed value".into(),
            input_schema: object_schema(),
        }
    }

    async fn invoke(
        &self,
        _ctx: ToolContext,
        _input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.output.clone())
    }
}

/// Fails with a plain error until the given call number.
struct FlakyTool {
    calls: AtomicU32,
    succeed_on: u32,
}

#[async_trait::async_trait]
impl ToolHandler for FlakyTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "flaky".into(),
            description: "fails then succeeds".into(),
            input_schema: object_schema(),
        }
    }

    async fn invoke(
        &self,
        _ctx: ToolContext,
        _input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            Err(ToolError::Fail(format!("transient failure on call {call}")))
        } else {
            Ok(serde_json::json!("ok"))
        }
    }
}

/// Snoozes until the given call number.
struct SnoozingTool {
    calls: AtomicU32,
    succeed_on: u32,
    snooze_for: Duration,
}

#[async_trait::async_trait]
impl ToolHandler for SnoozingTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "patient".into(),
            description: "waits for its moment".into(),
            input_schema: object_schema(),
        }
    }

    async fn invoke(
        &self,
        _ctx: ToolContext,
        _input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            Err(ToolError::snooze(self.snooze_for, "not ready yet"))
        } else {
            Ok(serde_json::json!("finally"))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1: single-shot completion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn single_shot_completion() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_text("hello", StopReason::EndTurn);

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .build();
    client.start().await.unwrap();

    client
        .create_agent(AgentDefinition::new("echo", "fake-model").system_prompt("echo"))
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    let reply = client.run_sync(session_id, "echo", "hello").await.unwrap();
    assert_eq!(reply.text(), "hello");
    assert_eq!(reply.role, Role::Assistant);

    let messages = client.list_messages(session_id, false).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].text(), "hello");
    assert_eq!(messages[1].role, Role::Assistant);

    let runs = client.list_runs(Default::default()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].result.as_deref(), Some("hello"));

    let iterations = client.list_iterations(runs[0].id).await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].stop_reason, StopReason::EndTurn);

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2: tool round-trip
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_tool_use("tu_1", "calc", serde_json::json!({}));
    model.push_text("42", StopReason::EndTurn);

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .register_tool(Arc::new(StaticTool {
            name: "calc",
            delay: Duration::ZERO,
            output: serde_json::json!("42"),
        }))
        .unwrap()
        .build();
    client.start().await.unwrap();

    client
        .create_agent(
            AgentDefinition::new("calculator", "fake-model").tools(vec!["calc".into()]),
        )
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    let reply = client
        .run_sync(session_id, "calculator", "compute")
        .await
        .unwrap();
    assert_eq!(reply.text(), "42");

    let messages = client.list_messages(session_id, false).await.unwrap();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]
    );
    match &messages[2].content[0] {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            assert_eq!(tool_use_id, "tu_1");
            assert_eq!(content, "42");
            assert!(!is_error);
        }
        other => panic!("expected tool_result, got {other:?}"),
    }

    let runs = client.list_runs(Default::default()).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Completed);
    let iterations = client.list_iterations(runs[0].id).await.unwrap();
    assert_eq!(iterations.len(), 2);

    let execs = store.list_tool_executions(iterations[0].id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ToolStatus::Succeeded);
    assert_eq!(execs[0].output, Some(serde_json::json!("42")));

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3: retry on transient tool failure
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn transient_tool_failure_retries() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_tool_use("tu_1", "flaky", serde_json::json!({}));
    model.push_text("recovered", StopReason::EndTurn);

    let config = Config {
        tool_retry: ToolRetryConfig {
            max_attempts: 2,
            jitter: 0.0,
            ..ToolRetryConfig::default()
        },
        ..fast_config()
    };
    let client = Client::builder(store.clone(), model.clone())
        .config(config)
        .register_tool(Arc::new(FlakyTool {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        }))
        .unwrap()
        .build();
    client.start().await.unwrap();

    client
        .create_agent(AgentDefinition::new("resilient", "fake-model").tools(vec!["flaky".into()]))
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    let reply = client
        .run_sync(session_id, "resilient", "try it")
        .await
        .unwrap();
    assert_eq!(reply.text(), "recovered");

    let runs = client.list_runs(Default::default()).await.unwrap();
    let iterations = client.list_iterations(runs[0].id).await.unwrap();
    let execs = store.list_tool_executions(iterations[0].id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ToolStatus::Succeeded);
    // Second attempt won; the first failure stayed recorded.
    assert_eq!(execs[0].attempt, 2);
    assert!(execs[0]
        .error
        .as_deref()
        .unwrap()
        .contains("transient failure on call 1"));

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4: snooze
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn snooze_defers_without_consuming_attempts() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_tool_use("tu_1", "patient", serde_json::json!({}));
    model.push_text("done waiting", StopReason::EndTurn);

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .register_tool(Arc::new(SnoozingTool {
            calls: AtomicU32::new(0),
            succeed_on: 3,
            snooze_for: Duration::from_millis(100),
        }))
        .unwrap()
        .build();
    client.start().await.unwrap();

    client
        .create_agent(AgentDefinition::new("waiter", "fake-model").tools(vec!["patient".into()]))
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    let started = tokio::time::Instant::now();
    let reply = client.run_sync(session_id, "waiter", "wait").await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(reply.text(), "done waiting");
    assert!(
        elapsed >= Duration::from_millis(200),
        "two snoozes of 100ms each must take at least 200ms, took {elapsed:?}"
    );

    let runs = client.list_runs(Default::default()).await.unwrap();
    let iterations = client.list_iterations(runs[0].id).await.unwrap();
    let execs = store.list_tool_executions(iterations[0].id).await.unwrap();
    assert_eq!(execs[0].status, ToolStatus::Succeeded);
    // Snoozing never consumed an attempt.
    assert_eq!(execs[0].attempt, 1);

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5: rescue of an abandoned run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn abandoned_run_is_rescued_and_completed() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_text("rescued", StopReason::EndTurn);

    // Seed agent, session, and a run claimed by a worker that then "dies"
    // (claims but never heartbeats or progresses).
    let agent = store
        .upsert_agent(AgentDefinition::new("echo", "fake-model"))
        .await
        .unwrap();
    let session = store.create_session(NewSession::default()).await.unwrap();
    let run = store
        .create_run(mill_domain::run::NewRun::new(session.id, agent.id, "ping"))
        .await
        .unwrap();
    let dead_worker = uuid::Uuid::new_v4();
    let claimed = store.claim_run(dead_worker).await.unwrap().unwrap();
    assert_eq!(claimed.id, run.id);

    // A surviving client whose rescue treats any stale heartbeat as stuck.
    let config = Config {
        rescue: mill_domain::config::RunRescueConfig {
            rescue_interval: Duration::from_millis(50),
            // Long enough that live workers (heartbeating every 50ms)
            // never look stuck, short enough that the dead claim does.
            rescue_timeout: Duration::from_millis(250),
            max_rescue_attempts: 3,
        },
        ..fast_config()
    };
    let client = Client::builder(store.clone(), model.clone())
        .config(config)
        .build();
    client.start().await.unwrap();

    let finished = client.wait_for_run(run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.result.as_deref(), Some("rescued"));
    assert_eq!(finished.attempt, 1, "rescue increments the attempt once");

    // The dead worker's late writes are rejected.
    assert!(matches!(
        store.heartbeat_run(run.id, dead_worker).await,
        Err(Error::LostClaim)
    ));

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6: compaction preserves the suffix
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn compaction_bounds_window_and_preserves_suffix() {
    use mill_client::compact::maybe_compact;
    use mill_domain::message::text_content;

    let store = MemoryStore::new();
    let agent = store
        .upsert_agent(
            AgentDefinition::new("historian", "fake-model").config(AgentConfig {
                auto_compaction: true,
                // 10k tokens of history against a trigger of 5k.
                compaction_trigger: 5_000.0 / 200_000.0,
                compaction_target: 2_000,
                compaction_preserve_n: 3,
                compaction_protected_tokens: 1_000,
                ..AgentConfig::default()
            }),
        )
        .await
        .unwrap();
    let session = store.create_session(NewSession::default()).await.unwrap();
    for i in 0..20 {
        store
            .append_message(
                session.id,
                if i % 2 == 0 { Role::User } else { Role::Assistant },
                text_content(format!("turn {i}")),
                500,
            )
            .await
            .unwrap();
    }
    let before = store.list_messages(session.id, false).await.unwrap();
    let last_three: Vec<_> = before[17..].to_vec();

    let model = ScriptedModel::new();
    model.push_text("summary of turns 0 through 16", StopReason::EndTurn);

    let outcome = maybe_compact(&store, &model, &agent, session.id)
        .await
        .unwrap();
    assert_ne!(outcome.strategy, mill_client::CompactionStrategy::NoOp);

    let active = store.list_messages(session.id, false).await.unwrap();
    let total: i64 = active.iter().map(|m| m.token_count).sum();
    assert!(total <= 2_000, "active window at {total} tokens");
    assert!(active[0].is_summary);
    let tail = &active[active.len() - 3..];
    for (kept, original) in tail.iter().zip(&last_three) {
        assert_eq!(kept.id, original.id);
        assert_eq!(kept.content, original.content);
        assert_eq!(kept.seq, original.seq);
    }
    assert_eq!(
        store.get_session(session.id).await.unwrap().compaction_count,
        1
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ordering law: tool_result order equals tool_use order
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_results_follow_tool_use_order_not_completion_order() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_message(
        vec![
            ContentBlock::ToolUse {
                id: "tu_slow".into(),
                name: "slow".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::ToolUse {
                id: "tu_fast".into(),
                name: "fast".into(),
                input: serde_json::json!({}),
            },
        ],
        StopReason::ToolUse,
    );
    model.push_text("both done", StopReason::EndTurn);

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .register_tool(Arc::new(StaticTool {
            name: "slow",
            delay: Duration::from_millis(150),
            output: serde_json::json!("slow result"),
        }))
        .unwrap()
        .register_tool(Arc::new(StaticTool {
            name: "fast",
            delay: Duration::ZERO,
            output: serde_json::json!("fast result"),
        }))
        .unwrap()
        .build();
    client.start().await.unwrap();

    client
        .create_agent(
            AgentDefinition::new("parallel", "fake-model")
                .tools(vec!["slow".into(), "fast".into()]),
        )
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    client
        .run_sync(session_id, "parallel", "do both")
        .await
        .unwrap();

    let messages = client.list_messages(session_id, false).await.unwrap();
    let tool_result_ids: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::ToolResult)
        .flat_map(|m| {
            m.content.iter().filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
        })
        .collect();
    // "fast" finished first, but injection follows tool_use order.
    assert_eq!(tool_result_ids, vec!["tu_slow", "tu_fast"]);

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Nested delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn sub_agent_delegation_creates_child_run() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    // Parent asks for the researcher, the researcher answers, the parent
    // folds the answer in.
    model.push_tool_use(
        "tu_delegate",
        "researcher",
        serde_json::json!({"prompt": "look this up"}),
    );
    model.push_text("the answer is blue", StopReason::EndTurn);
    model.push_text("research says: the answer is blue", StopReason::EndTurn);

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .build();
    client.start().await.unwrap();

    let researcher = client
        .create_agent(AgentDefinition::new("researcher", "fake-model"))
        .await
        .unwrap();
    client
        .create_agent(
            AgentDefinition::new("lead", "fake-model").sub_agents(vec![researcher.id]),
        )
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    let reply = client
        .run_sync(session_id, "lead", "find the answer")
        .await
        .unwrap();
    assert_eq!(reply.text(), "research says: the answer is blue");

    let runs = client.list_runs(Default::default()).await.unwrap();
    assert_eq!(runs.len(), 2);
    let parent = runs
        .iter()
        .find(|r| r.parent_run_id.is_none())
        .expect("parent run");
    let child = runs
        .iter()
        .find(|r| r.parent_run_id == Some(parent.id))
        .expect("child run");
    assert_eq!(child.status, RunStatus::Completed);
    assert_eq!(child.result.as_deref(), Some("the answer is blue"));
    assert_eq!(child.input_prompt, "look this up");

    // The child ran in its own session parented to the lead's.
    let child_session = client.get_session(child.session_id).await.unwrap();
    assert_eq!(child_session.parent_session_id, Some(session_id));

    // The delegation result reached the parent conversation as a
    // tool_result.
    let messages = client.list_messages(session_id, false).await.unwrap();
    let tool_result = messages
        .iter()
        .find(|m| m.role == Role::ToolResult)
        .expect("tool_result message");
    assert!(tool_result.text().is_empty());
    match &tool_result.content[0] {
        ContentBlock::ToolResult { content, .. } => {
            assert_eq!(content, "the answer is blue");
        }
        other => panic!("expected tool_result, got {other:?}"),
    }

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn cancel_aborts_run_waiting_on_tools() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_tool_use("tu_1", "glacial", serde_json::json!({}));
    // No further steps: the run must never need them.

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .register_tool(Arc::new(StaticTool {
            name: "glacial",
            delay: Duration::from_secs(2),
            output: serde_json::json!("too late"),
        }))
        .unwrap()
        .build();
    client.start().await.unwrap();

    client
        .create_agent(AgentDefinition::new("slowpoke", "fake-model").tools(vec!["glacial".into()]))
        .await
        .unwrap();
    let session_id = new_session(&client).await;
    let run = client
        .create_run(session_id, "slowpoke", "take forever")
        .await
        .unwrap();

    // Wait until the run reaches the tool gate, then cancel.
    let waiting = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let r = client.get_run(run.id).await.unwrap();
            if r.status == RunStatus::WaitingForTools {
                return r;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run should reach waiting_for_tools");
    assert_eq!(waiting.status, RunStatus::WaitingForTools);

    client.cancel_run(run.id).await.unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), client.wait_for_run(run.id))
        .await
        .expect("cancellation must settle promptly")
        .unwrap();
    assert_eq!(finished.status, RunStatus::Cancelled);

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permanent model failure
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn permanent_model_error_fails_run() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_error(Some(400), "invalid request");

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .build();
    client.start().await.unwrap();

    client
        .create_agent(AgentDefinition::new("doomed", "fake-model"))
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    let err = client
        .run_sync(session_id, "doomed", "please fail")
        .await
        .unwrap_err();
    match err {
        Error::RunFailed { kind, message } => {
            assert_eq!(kind, mill_domain::ErrorKind::Permanent);
            assert!(message.contains("invalid request"));
        }
        other => panic!("expected RunFailed, got {other:?}"),
    }

    let runs = client.list_runs(Default::default()).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);

    client.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transient model failure recovers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn transient_model_error_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(ScriptedModel::new());
    model.push_error(Some(503), "overloaded");
    model.push_text("second try worked", StopReason::EndTurn);

    let client = Client::builder(store.clone(), model.clone())
        .config(fast_config())
        .build();
    client.start().await.unwrap();

    client
        .create_agent(AgentDefinition::new("persistent", "fake-model"))
        .await
        .unwrap();
    let session_id = new_session(&client).await;

    let reply = client
        .run_sync(session_id, "persistent", "keep at it")
        .await
        .unwrap();
    assert_eq!(reply.text(), "second try worked");
    assert_eq!(model.remaining(), 0);

    client.stop().await;
}
