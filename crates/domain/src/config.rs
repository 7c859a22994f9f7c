//! Shared policy configuration: rescue cadence and serde helpers.
//!
//! Client-level configuration (instance identity, pool sizes, hooks) lives
//! with the client; the pieces here are referenced from both the workers and
//! the store-facing sweeps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Rescue policy for abandoned runs and tool executions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRescueConfig {
    /// How often the leader scans for stuck rows.
    #[serde(with = "duration_secs")]
    pub rescue_interval: Duration,
    /// A claimed row whose heartbeat is older than this is stuck.
    #[serde(with = "duration_secs")]
    pub rescue_timeout: Duration,
    /// Requeues before the row is failed with a rescue-exhausted error.
    pub max_rescue_attempts: i32,
}

impl Default for RunRescueConfig {
    fn default() -> Self {
        Self {
            rescue_interval: Duration::from_secs(60),
            rescue_timeout: Duration::from_secs(300),
            max_rescue_attempts: 3,
        }
    }
}

/// Serde adapter storing a `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescue_defaults() {
        let cfg = RunRescueConfig::default();
        assert_eq!(cfg.rescue_timeout, Duration::from_secs(300));
        assert_eq!(cfg.max_rescue_attempts, 3);
    }

    #[test]
    fn duration_secs_round_trip() {
        let cfg = RunRescueConfig {
            rescue_interval: Duration::from_secs(15),
            rescue_timeout: Duration::from_secs(120),
            max_rescue_attempts: 1,
        };
        let v = serde_json::to_value(cfg).unwrap();
        assert_eq!(v["rescue_timeout"], 120);
        let back: RunRescueConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back, cfg);
    }
}
