//! Notification channel names and payloads.
//!
//! Notifications are hints, never proof: the payload carries just enough for
//! a waiter to decide whether to re-read the database. Duplicates are
//! permitted; droppped notifications are covered by the poll fallback.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened. Each kind maps to one fixed LISTEN/NOTIFY channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    /// A run was queued (created or requeued by rescue).
    RunReady,
    /// A run reached a terminal status.
    RunCompleted,
    /// A tool execution became claimable.
    ToolReady,
    /// A tool execution finished an attempt (terminal or requeued); the id
    /// is the owning run so its worker can re-evaluate the tool gate.
    ToolCompleted,
    /// An instance registered or deregistered.
    InstanceEvent,
}

impl NotifyKind {
    /// The fixed channel this kind is published on.
    pub fn channel(self) -> &'static str {
        match self {
            Self::RunReady => "agentmill_run_ready",
            Self::RunCompleted => "agentmill_run_completed",
            Self::ToolReady => "agentmill_tool_ready",
            Self::ToolCompleted => "agentmill_tool_completed",
            Self::InstanceEvent => "agentmill_instance_events",
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            "agentmill_run_ready" => Some(Self::RunReady),
            "agentmill_run_completed" => Some(Self::RunCompleted),
            "agentmill_tool_ready" => Some(Self::ToolReady),
            "agentmill_tool_completed" => Some(Self::ToolCompleted),
            "agentmill_instance_events" => Some(Self::InstanceEvent),
            _ => None,
        }
    }

    pub const ALL: [NotifyKind; 5] = [
        Self::RunReady,
        Self::RunCompleted,
        Self::ToolReady,
        Self::ToolCompleted,
        Self::InstanceEvent,
    ];
}

/// The wire payload, published as JSON inside the committing transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotifyKind,
    pub id: Uuid,
    pub status: String,
}

impl Notification {
    pub fn new(kind: NotifyKind, id: Uuid, status: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            status: status.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trip() {
        for kind in NotifyKind::ALL {
            assert_eq!(NotifyKind::from_channel(kind.channel()), Some(kind));
        }
        assert_eq!(NotifyKind::from_channel("something_else"), None);
    }

    #[test]
    fn payload_shape() {
        let n = Notification::new(NotifyKind::RunCompleted, Uuid::nil(), "completed");
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["kind"], "run_completed");
        assert_eq!(v["status"], "completed");
        let back: Notification = serde_json::from_value(v).unwrap();
        assert_eq!(back, n);
    }
}
