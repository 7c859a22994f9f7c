//! Tool retry policy.
//!
//! Delay grows with the fourth power of the attempt number; jitter spreads
//! simultaneous retries apart. A jitter of zero (the default) means instant
//! retry, which keeps single-process test suites fast and deterministic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy applied to plain tool failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolRetryConfig {
    /// Total attempts before an execution is marked failed.
    pub max_attempts: i32,
    /// Relative jitter in [0, 1). `<= 0` disables the delay entirely.
    pub jitter: f64,
    /// Upper bound on any single delay.
    #[serde(with = "crate::config::duration_secs")]
    pub max_delay: Duration,
}

impl Default for ToolRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            jitter: 0.0,
            max_delay: Duration::from_secs(3600),
        }
    }
}

const BASE: Duration = Duration::from_secs(1);

/// Delay before retrying attempt `attempt + 1`.
///
/// `base · attempt⁴ · (1 ± jitter)`, capped at `max_delay`. Instant when
/// jitter is disabled.
pub fn retry_delay(attempt: i32, cfg: &ToolRetryConfig) -> Duration {
    if cfg.jitter <= 0.0 {
        return Duration::ZERO;
    }
    let k = attempt.max(1) as f64;
    let nominal = BASE.as_secs_f64() * k * k * k * k;
    let spread = 1.0 + cfg.jitter * (2.0 * rand::random::<f64>() - 1.0);
    let secs = (nominal * spread).max(0.0);
    Duration::from_secs_f64(secs).min(cfg.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_jitter_is_instant() {
        let cfg = ToolRetryConfig::default();
        assert_eq!(retry_delay(1, &cfg), Duration::ZERO);
        assert_eq!(retry_delay(5, &cfg), Duration::ZERO);
    }

    #[test]
    fn delay_grows_with_fourth_power() {
        let cfg = ToolRetryConfig {
            max_attempts: 5,
            jitter: 0.2,
            max_delay: Duration::from_secs(100_000),
        };
        // attempt=2 nominal is 16 s; with ±20% jitter the delay lands
        // in [12.8, 19.2].
        for _ in 0..32 {
            let d = retry_delay(2, &cfg).as_secs_f64();
            assert!((12.8..=19.2).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn delay_is_capped() {
        let cfg = ToolRetryConfig {
            max_attempts: 10,
            jitter: 0.1,
            max_delay: Duration::from_secs(30),
        };
        // attempt=10 nominal is 10_000 s, far past the cap.
        assert_eq!(retry_delay(10, &cfg), Duration::from_secs(30));
    }

    #[test]
    fn config_serde_defaults() {
        let cfg: ToolRetryConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.jitter, 0.0);
    }
}
