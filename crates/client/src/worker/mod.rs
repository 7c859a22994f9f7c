//! Worker pools: shared context plus the run and tool execution loops.

pub(crate) mod run_worker;
pub(crate) mod tool_worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use mill_domain::model::ModelClient;
use mill_store::{NotifyKind, Store};

use crate::config::Config;
use crate::hub::Subscription;
use crate::registry::ToolRegistry;

/// Everything a worker task needs, shared across both pools.
pub(crate) struct WorkerCtx<S: Store> {
    pub store: Arc<S>,
    pub model: Arc<dyn ModelClient>,
    pub registry: Arc<ToolRegistry>,
    pub config: Config,
    pub instance_id: Uuid,
}

impl<S: Store> WorkerCtx<S> {
    pub(crate) fn subscribe(
        &self,
        kind: NotifyKind,
        id: Option<Uuid>,
        poll_fallback: Duration,
    ) -> Subscription {
        Subscription::new(self.store.subscribe(), kind, id, poll_fallback)
    }
}

/// Spawn a heartbeat task for a claimed row. The returned flag flips once
/// the claim is lost (rescued or cancelled); the handle must be aborted
/// when the work finishes.
pub(crate) fn spawn_row_heartbeat<F, Fut>(
    interval: Duration,
    beat: F,
) -> (Arc<std::sync::atomic::AtomicBool>, JoinHandle<()>)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = mill_domain::Result<()>> + Send,
{
    use std::sync::atomic::{AtomicBool, Ordering};

    let lost = Arc::new(AtomicBool::new(false));
    let flag = lost.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match beat().await {
                Ok(()) => {}
                Err(mill_domain::Error::LostClaim) => {
                    flag.store(true, Ordering::Release);
                    return;
                }
                Err(e) => {
                    // Transient heartbeat trouble; the row only becomes
                    // stuck after the rescue timeout, so keep trying.
                    tracing::warn!(error = %e, "heartbeat failed");
                }
            }
        }
    });
    (lost, handle)
}
