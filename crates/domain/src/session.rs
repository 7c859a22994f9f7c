//! Session rows — the ordered conversation containers runs execute against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: String,
    /// Caller-chosen handle (e.g. a channel or conversation key).
    pub identifier: String,
    /// Set when this session was spawned for a delegated child run.
    pub parent_session_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    /// How many times compaction has rewritten the active window.
    pub compaction_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub tenant_id: String,
    pub identifier: String,
    pub parent_session_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}
