//! PostgreSQL store backend (sqlx).
//!
//! Every operation is one transaction; notifications are emitted with
//! `pg_notify` inside the committing transaction so listeners never observe
//! a hint before the row is visible. Transient I/O errors are retried here
//! with capped backoff before they reach any caller.

mod coord;
mod listener;
mod registry;
mod rows;
mod run;
mod session;
mod tool;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use mill_domain::{Error, Result};

use crate::notify::{Notification, NotifyKind};

const EVENT_BUFFER: usize = 1024;

/// PostgreSQL-backed [`Store`](crate::Store).
pub struct PgStore {
    pool: PgPool,
    events: broadcast::Sender<Notification>,
    listener: JoinHandle<()>,
}

impl PgStore {
    /// Connect a pool and start the LISTEN task.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let listener = tokio::spawn(listener::run(database_url.to_owned(), events.clone()));
        Ok(Self {
            pool,
            events,
            listener,
        })
    }

    /// Apply the embedded migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::TransientIo(format!("migrate: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn event_sender(&self) -> &broadcast::Sender<Notification> {
        &self.events
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a sqlx failure into the shared taxonomy. Connection-level problems
/// and serialization failures are transient; everything else is surfaced
/// as-is for the caller to treat as permanent.
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::TransientIo(e.to_string()),
        sqlx::Error::Database(db) => {
            // 40001 serialization_failure, 40P01 deadlock_detected.
            let code = db.code();
            let code = code.as_deref().unwrap_or("");
            if code == "40001" || code == "40P01" {
                Error::TransientIo(e.to_string())
            } else if code == "23505" {
                Error::Conflict(e.to_string())
            } else {
                Error::InvariantViolation(e.to_string())
            }
        }
        _ => Error::TransientIo(e.to_string()),
    }
}

pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Error {
    Error::NotFound {
        entity,
        id: id.to_string(),
    }
}

/// Emit a notification inside the transaction that commits the transition.
pub(crate) async fn notify_tx(
    tx: &mut Transaction<'_, Postgres>,
    kind: NotifyKind,
    id: Uuid,
    status: &str,
) -> Result<()> {
    let payload = serde_json::to_string(&Notification::new(kind, id, status))?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(kind.channel())
        .bind(payload)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Retry the wrapped store operation on transient I/O, with capped backoff.
/// Exhaustion bubbles the typed error to the caller.
macro_rules! retrying {
    ($op:literal, $body:expr) => {{
        let mut attempt = 0u32;
        let mut delay = std::time::Duration::from_millis(50);
        loop {
            match $body {
                Err(mill_domain::Error::TransientIo(msg)) if attempt < 3 => {
                    attempt += 1;
                    tracing::warn!(
                        op = $op,
                        attempt,
                        error = %msg,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 4).min(std::time::Duration::from_secs(1));
                }
                other => break other,
            }
        }
    }};
}
pub(crate) use retrying;
