//! Instance and leader-lease rows, plus the liveness rule.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A running process of this system, advertised in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    /// Usually the hostname.
    pub name: String,
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Instance {
    /// An instance is alive iff its heartbeat is no older than three
    /// heartbeat intervals.
    pub fn is_alive(&self, heartbeat_interval: std::time::Duration, now: DateTime<Utc>) -> bool {
        let window = ChronoDuration::from_std(heartbeat_interval * 3)
            .unwrap_or_else(|_| ChronoDuration::seconds(45));
        now - self.last_heartbeat_at <= window
    }
}

/// The singleton advisory leader lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub instance_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn liveness_window() {
        let now = Utc::now();
        let inst = Instance {
            id: Uuid::new_v4(),
            name: "host-a".into(),
            metadata: serde_json::Value::Null,
            started_at: now,
            last_heartbeat_at: now - ChronoDuration::seconds(30),
        };
        // 3 × 15 s window: a 30 s old heartbeat is alive, a 60 s one is not.
        assert!(inst.is_alive(Duration::from_secs(15), now));
        let stale = Instance {
            last_heartbeat_at: now - ChronoDuration::seconds(60),
            ..inst
        };
        assert!(!stale.is_alive(Duration::from_secs(15), now));
    }
}
