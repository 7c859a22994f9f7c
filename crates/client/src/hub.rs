//! Notification subscriptions with a poll floor.
//!
//! A [`Subscription`] wakes its owner when a matching hint arrives or when
//! the fallback interval elapses — whichever is first. Either way the owner
//! re-reads the database before acting; notifications are hints, not proof,
//! and dropped or duplicated hints are harmless.

use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use mill_store::{Notification, NotifyKind};

/// A filtered view over the store's notification stream.
pub struct Subscription {
    rx: broadcast::Receiver<Notification>,
    kind: NotifyKind,
    /// None matches every id of the kind (worker wake-ups).
    id: Option<Uuid>,
    poll_fallback: Duration,
}

impl Subscription {
    pub fn new(
        rx: broadcast::Receiver<Notification>,
        kind: NotifyKind,
        id: Option<Uuid>,
        poll_fallback: Duration,
    ) -> Self {
        Self {
            rx,
            kind,
            id,
            poll_fallback,
        }
    }

    /// Wait for the next matching hint; `None` means the poll floor elapsed
    /// first (or the channel lagged) and the caller should re-read anyway.
    pub async fn wait(&mut self) -> Option<Notification> {
        let deadline = tokio::time::Instant::now() + self.poll_fallback;
        loop {
            let recv = tokio::time::timeout_at(deadline, self.rx.recv()).await;
            match recv {
                Err(_) => return None,
                Ok(Ok(n)) => {
                    if n.kind == self.kind && self.id.map_or(true, |id| n.id == id) {
                        return Some(n);
                    }
                }
                // Lagged or closed: the poll floor still guarantees
                // progress, so treat it like a timeout.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            }
        }
    }
}
