//! Leader election loop.
//!
//! Follower → try to take the lease every `leader_ttl / 3`; Leader → renew
//! on the same cadence. A failed renewal demotes immediately. The hooks
//! fire on every transition; the shared flag gates the rescue sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use mill_store::Store;

use crate::config::Config;

pub(crate) async fn election_loop<S: Store>(
    store: Arc<S>,
    instance_id: Uuid,
    config: Config,
    is_leader: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let cadence = config.leader_ttl / 3;
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let currently_leader = is_leader.load(Ordering::Acquire);
        let result = if currently_leader {
            store.renew_leader(instance_id, config.leader_ttl).await
        } else {
            store.try_acquire_leader(instance_id, config.leader_ttl).await
        };

        match result {
            Ok(held) if held && !currently_leader => {
                tracing::info!(instance_id = %instance_id, "became leader");
                is_leader.store(true, Ordering::Release);
                if let Some(hook) = &config.on_became_leader {
                    hook();
                }
            }
            Ok(held) if !held && currently_leader => {
                tracing::info!(instance_id = %instance_id, "lost leadership");
                is_leader.store(false, Ordering::Release);
                if let Some(hook) = &config.on_lost_leadership {
                    hook();
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "leader election step failed");
                config.report_error(&e);
                // Fail safe: never run singleton work on an uncertain lease.
                if currently_leader {
                    is_leader.store(false, Ordering::Release);
                    if let Some(hook) = &config.on_lost_leadership {
                        hook();
                    }
                }
            }
        }
    }

    if is_leader.swap(false, Ordering::AcqRel) {
        let _ = store.release_leader(instance_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_store::{CoordinationOps, MemoryStore};
    use std::time::Duration;

    fn fast_config() -> Config {
        Config {
            heartbeat_interval: Duration::from_millis(5),
            leader_ttl: Duration::from_millis(60),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn single_instance_becomes_leader() {
        let store = Arc::new(MemoryStore::new());
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(election_loop(
            store.clone(),
            Uuid::new_v4(),
            fast_config(),
            flag.clone(),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(flag.load(Ordering::Acquire));

        tx.send(true).unwrap();
        handle.await.unwrap();
        // Lease released on shutdown: someone else can take it instantly.
        assert!(store
            .try_acquire_leader(Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn at_most_one_leader_among_competitors() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let mut flags = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let flag = Arc::new(AtomicBool::new(false));
            flags.push(flag.clone());
            handles.push(tokio::spawn(election_loop(
                store.clone(),
                Uuid::new_v4(),
                fast_config(),
                flag,
                rx.clone(),
            )));
        }

        // Sample repeatedly: never more than one leader at once.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let leaders = flags
                .iter()
                .filter(|f| f.load(Ordering::Acquire))
                .count();
            assert!(leaders <= 1, "observed {leaders} simultaneous leaders");
        }
        // And someone did become leader eventually.
        assert!(flags.iter().any(|f| f.load(Ordering::Acquire)));

        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }
}
