//! Instance heartbeat loop.
//!
//! Registers the process on start, refreshes its row every heartbeat
//! interval, and re-inserts it if the leader's cleanup purged it (which can
//! happen after a long GC pause or network partition).

use std::sync::Arc;

use tokio::sync::watch;

use mill_domain::instance::Instance;
use mill_store::Store;

use crate::config::Config;

pub(crate) async fn heartbeat_loop<S: Store>(
    store: Arc<S>,
    instance: Instance,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; registration already happened.
    ticker.tick().await;

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

        match store.refresh_instance(instance.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(instance_id = %instance.id, "instance row purged, re-registering");
                let mut fresh = instance.clone();
                fresh.last_heartbeat_at = chrono::Utc::now();
                if let Err(e) = store.register_instance(&fresh).await {
                    tracing::warn!(error = %e, "instance re-registration failed");
                    config.report_error(&e);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "instance heartbeat failed");
                config.report_error(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mill_store::{CoordinationOps, MemoryStore};
    use std::time::Duration;
    use uuid::Uuid;

    fn instance() -> Instance {
        Instance {
            id: Uuid::new_v4(),
            name: "test-host".into(),
            metadata: serde_json::Value::Null,
            started_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn refreshes_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let inst = instance();
        store.register_instance(&inst).await.unwrap();
        let before = store.list_instances().await.unwrap()[0].last_heartbeat_at;

        let config = Config {
            heartbeat_interval: Duration::from_millis(10),
            ..Config::default()
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(store.clone(), inst, config, rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let after = store.list_instances().await.unwrap()[0].last_heartbeat_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn reregisters_after_purge() {
        let store = Arc::new(MemoryStore::new());
        let inst = instance();
        store.register_instance(&inst).await.unwrap();
        // Simulate the leader purging this instance.
        store.remove_instance(inst.id).await.unwrap();

        let config = Config {
            heartbeat_interval: Duration::from_millis(10),
            ..Config::default()
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(store.clone(), inst.clone(), config, rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let instances = store.list_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, inst.id);
    }
}
