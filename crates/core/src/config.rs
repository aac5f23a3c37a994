use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Handler time bound for nodes that do not declare `timeout_secs`
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// How long a claim or commit keeps an execution leased
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// How often a running dispatch renews its lease and checks for cancellation
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        crate::clock::saturating_seconds(self.lease_ttl_secs)
    }

    /// Heartbeat period, at most a third of the lease TTL
    pub fn heartbeat_interval(&self) -> Duration {
        let third = Duration::from_secs(self.lease_ttl_secs) / 3;
        Duration::from_millis(self.heartbeat_interval_ms)
            .min(third)
            .max(MIN_HEARTBEAT)
    }
}

/// Polling worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers started in one process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Executions claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on `advance` calls per claimed execution per cycle
    #[serde(default = "default_max_steps_per_claim")]
    pub max_steps_per_claim: usize,
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    16
}

fn default_max_steps_per_claim() -> usize {
    64
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_steps_per_claim: default_max_steps_per_claim(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_stays_inside_lease() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));

        let short = EngineConfig {
            lease_ttl_secs: 3,
            heartbeat_interval_ms: 5000,
            ..EngineConfig::default()
        };
        assert_eq!(short.heartbeat_interval(), Duration::from_secs(1));

        let zero = EngineConfig {
            lease_ttl_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(zero.heartbeat_interval(), MIN_HEARTBEAT);
    }

    #[test]
    fn test_huge_lease_ttl_saturates() {
        let config = EngineConfig {
            lease_ttl_secs: u64::MAX,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.lease_ttl(),
            crate::clock::saturating_seconds(crate::clock::MAX_DURATION_SECS)
        );
    }
}
