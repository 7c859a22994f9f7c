//! Client configuration: instance identity, timing knobs, pool sizes, and
//! observability hooks. Pool sizes are configuration, not auto-tuned.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use mill_domain::config::RunRescueConfig;
use mill_domain::retry::ToolRetryConfig;
use mill_domain::Error;

use crate::compact::CompactionOutcome;

/// Called with every background-loop error. Loops log and keep going; they
/// never crash the client.
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Called on leadership transitions.
pub type LeaderHook = Arc<dyn Fn() + Send + Sync>;

/// Called after every applied compaction.
pub type CompactionHook = Arc<dyn Fn(&CompactionOutcome) + Send + Sync>;

/// Client configuration. `Default` gives the documented defaults.
#[derive(Clone)]
pub struct Config {
    /// Instance id; generated when not set.
    pub id: Option<Uuid>,
    /// Instance name; hostname when not set.
    pub name: Option<String>,
    pub metadata: serde_json::Value,

    /// Instance and claimed-row heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Leader lease duration; must be at least twice the heartbeat interval.
    pub leader_ttl: Duration,
    /// A run whose heartbeat is older than this is eligible for rescue, and
    /// model-call retries give up past it.
    pub stuck_run_timeout: Duration,
    /// Fallback poll when no run_ready notification arrives.
    pub run_poll_interval: Duration,
    /// Fallback poll when no tool_ready notification arrives.
    pub tool_poll_interval: Duration,
    /// Poll floor for synchronous waiters while the listener is down.
    pub poll_fallback_interval: Duration,
    /// Leader-side sweep cadence (rescue + stale-instance purge).
    pub cleanup_interval: Duration,

    /// Run worker pool size.
    pub max_concurrent_runs: usize,
    /// Tool worker pool size.
    pub max_concurrent_tools: usize,

    pub tool_retry: ToolRetryConfig,
    pub rescue: RunRescueConfig,

    pub on_error: Option<ErrorHook>,
    pub on_became_leader: Option<LeaderHook>,
    pub on_lost_leadership: Option<LeaderHook>,
    pub on_compaction: Option<CompactionHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            metadata: serde_json::Value::Null,
            heartbeat_interval: Duration::from_secs(15),
            leader_ttl: Duration::from_secs(30),
            stuck_run_timeout: Duration::from_secs(300),
            run_poll_interval: Duration::from_secs(1),
            tool_poll_interval: Duration::from_secs(1),
            poll_fallback_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            max_concurrent_runs: 10,
            max_concurrent_tools: 50,
            tool_retry: ToolRetryConfig::default(),
            rescue: RunRescueConfig::default(),
            on_error: None,
            on_became_leader: None,
            on_lost_leadership: None,
            on_compaction: None,
        }
    }
}

impl Config {
    /// Clamp invalid combinations instead of failing startup: the leader
    /// lease must outlive two heartbeat windows for clock-skew tolerance.
    pub fn normalized(mut self) -> Self {
        let floor = self.heartbeat_interval * 2;
        if self.leader_ttl < floor {
            tracing::warn!(
                leader_ttl_s = self.leader_ttl.as_secs(),
                floor_s = floor.as_secs(),
                "leader_ttl below 2x heartbeat_interval, clamping"
            );
            self.leader_ttl = floor;
        }
        self
    }

    pub(crate) fn report_error(&self, error: &Error) {
        if let Some(hook) = &self.on_error {
            hook(error);
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("leader_ttl", &self.leader_ttl)
            .field("stuck_run_timeout", &self.stuck_run_timeout)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("max_concurrent_tools", &self.max_concurrent_tools)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let cfg = Config::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.leader_ttl, Duration::from_secs(30));
        assert_eq!(cfg.stuck_run_timeout, Duration::from_secs(300));
        assert_eq!(cfg.max_concurrent_runs, 10);
        assert_eq!(cfg.max_concurrent_tools, 50);
        assert_eq!(cfg.tool_retry.max_attempts, 2);
        assert_eq!(cfg.tool_retry.jitter, 0.0);
    }

    #[test]
    fn normalize_clamps_leader_ttl() {
        let cfg = Config {
            heartbeat_interval: Duration::from_secs(20),
            leader_ttl: Duration::from_secs(10),
            ..Config::default()
        }
        .normalized();
        assert_eq!(cfg.leader_ttl, Duration::from_secs(40));
    }
}
