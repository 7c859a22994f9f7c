//! Leader-only rescue and cleanup sweep.
//!
//! Returns abandoned runs and tool executions to the queue (or fails them
//! once rescue is exhausted) and purges instance rows that stopped
//! heartbeating. Rescue is idempotent: a previously-abandoned worker that
//! comes back and writes loses its CAS predicate, never the rescued row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use mill_domain::run::RunError;
use mill_store::Store;

use crate::config::Config;

pub(crate) async fn sweep_loop<S: Store>(
    store: Arc<S>,
    config: Config,
    is_leader: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        if !is_leader.load(Ordering::Acquire) {
            continue;
        }
        if let Err(e) = sweep(store.as_ref(), &config).await {
            tracing::warn!(error = %e, "rescue sweep failed");
            config.report_error(&e);
        }
    }
}

/// One full sweep: stuck runs, stuck tools, stale instances.
pub(crate) async fn sweep<S: Store>(store: &S, config: &Config) -> mill_domain::Result<()> {
    let now = Utc::now();
    let run_cutoff = now
        - chrono::Duration::from_std(config.rescue.rescue_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

    for run in store.find_stuck_runs(run_cutoff).await? {
        if run.attempt < config.rescue.max_rescue_attempts {
            tracing::info!(
                run_id = %run.id,
                attempt = run.attempt,
                "rescuing stuck run"
            );
            store.requeue_run(run.id).await?;
        } else {
            tracing::warn!(
                run_id = %run.id,
                attempt = run.attempt,
                "rescue exhausted, failing run"
            );
            store
                .fail_run(run.id, None, RunError::rescue_exhausted(run.attempt))
                .await?;
        }
    }

    for te in store.find_stuck_tool_executions(run_cutoff).await? {
        if te.attempt < te.max_attempts + config.rescue.max_rescue_attempts {
            tracing::info!(
                tool_execution_id = %te.id,
                tool = %te.tool_name,
                "rescuing stuck tool execution"
            );
            store.requeue_tool_execution(te.id).await?;
        } else {
            store
                .fail_tool_rescued(
                    te.id,
                    format!("rescue exhausted after {} attempts", te.attempt),
                )
                .await?;
        }
    }

    let instance_cutoff = now
        - chrono::Duration::from_std(config.heartbeat_interval * 3)
            .unwrap_or_else(|_| chrono::Duration::seconds(45));
    let purged = store.delete_stale_instances(instance_cutoff).await?;
    if purged > 0 {
        tracing::info!(purged, "purged stale instances");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use mill_domain::agent::AgentDefinition;
    use mill_domain::instance::Instance;
    use mill_domain::run::{NewRun, RunStatus};
    use mill_domain::session::NewSession;
    use mill_store::{CoordinationOps, MemoryStore, RegistryOps, RunOps, SessionOps};
    use std::time::Duration;
    use uuid::Uuid;

    async fn stuck_run(store: &MemoryStore) -> Uuid {
        let session = store.create_session(NewSession::default()).await.unwrap();
        let agent = store
            .upsert_agent(AgentDefinition::new("a", "m"))
            .await
            .unwrap();
        store
            .create_run(NewRun::new(session.id, agent.id, "x"))
            .await
            .unwrap();
        let run = store.claim_run(Uuid::new_v4()).await.unwrap().unwrap();
        run.id
    }

    fn config() -> Config {
        Config {
            rescue: mill_domain::config::RunRescueConfig {
                rescue_interval: Duration::from_secs(1),
                // Everything claimed before "now" counts as stuck.
                rescue_timeout: Duration::from_millis(0),
                max_rescue_attempts: 2,
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn requeues_stuck_run() {
        let store = MemoryStore::new();
        let run_id = stuck_run(&store).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        sweep(&store, &config()).await.unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempt, 1);
        assert!(run.claimed_by.is_none());
    }

    #[tokio::test]
    async fn back_to_back_sweeps_produce_one_queued_row() {
        let store = MemoryStore::new();
        let run_id = stuck_run(&store).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cfg = config();
        sweep(&store, &cfg).await.unwrap();
        sweep(&store, &cfg).await.unwrap();

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        // The second sweep saw a queued (not stuck) run and did nothing.
        assert_eq!(run.attempt, 1);
    }

    #[tokio::test]
    async fn exhausted_run_fails() {
        let store = MemoryStore::new();
        let run_id = stuck_run(&store).await;
        let cfg = config();

        // Rescue, reclaim, repeat past the limit.
        for _ in 0..cfg.rescue.max_rescue_attempts {
            tokio::time::sleep(Duration::from_millis(5)).await;
            sweep(&store, &cfg).await.unwrap();
            store.claim_run(Uuid::new_v4()).await.unwrap().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        sweep(&store, &cfg).await.unwrap();

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert!(error.message.contains("rescue exhausted"));
    }

    #[tokio::test]
    async fn purges_stale_instances() {
        let store = MemoryStore::new();
        let stale = Instance {
            id: Uuid::new_v4(),
            name: "dead".into(),
            metadata: serde_json::Value::Null,
            started_at: Utc::now() - ChronoDuration::seconds(600),
            last_heartbeat_at: Utc::now() - ChronoDuration::seconds(600),
        };
        let fresh = Instance {
            id: Uuid::new_v4(),
            name: "alive".into(),
            metadata: serde_json::Value::Null,
            started_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
        };
        store.register_instance(&stale).await.unwrap();
        store.register_instance(&fresh).await.unwrap();

        sweep(&store, &config()).await.unwrap();

        let instances = store.list_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, fresh.id);
    }
}
