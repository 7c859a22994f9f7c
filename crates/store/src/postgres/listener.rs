//! The dedicated LISTEN connection.
//!
//! One long-lived task per store fans database notifications out to the
//! in-process broadcast channel. Reconnects with exponential backoff;
//! waiters keep making progress through their poll fallback while the
//! connection is down, so a dropped notification is never fatal.

use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::sync::broadcast;

use crate::notify::{Notification, NotifyKind};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

pub(super) async fn run(database_url: String, events: broadcast::Sender<Notification>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        // listen_loop only returns on error.
        let e = match listen_loop(&database_url, &events).await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        tracing::warn!(
            error = %e,
            backoff_ms = backoff.as_millis() as u64,
            "listener connection lost, reconnecting"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn listen_loop(
    database_url: &str,
    events: &broadcast::Sender<Notification>,
) -> Result<std::convert::Infallible, sqlx::Error> {
    let mut listener = PgListener::connect(database_url).await?;
    let channels: Vec<&str> = NotifyKind::ALL.iter().map(|k| k.channel()).collect();
    listener.listen_all(channels).await?;
    tracing::debug!("listener connected");

    loop {
        let message = listener.recv().await?;
        let Some(kind) = NotifyKind::from_channel(message.channel()) else {
            continue;
        };
        match serde_json::from_str::<Notification>(message.payload()) {
            Ok(notification) if notification.kind == kind => {
                // No receivers is fine.
                let _ = events.send(notification);
            }
            Ok(notification) => {
                tracing::warn!(
                    channel = message.channel(),
                    kind = ?notification.kind,
                    "notification kind does not match its channel, dropping"
                );
            }
            Err(e) => {
                tracing::warn!(
                    channel = message.channel(),
                    error = %e,
                    "malformed notification payload, dropping"
                );
            }
        }
    }
}
