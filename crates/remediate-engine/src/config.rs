use std::time::Duration;

use serde::Deserialize;

/// Top-level engine configuration, usually read from a TOML file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub breaker: BreakerConfig,
    pub rate: RateConfig,
    pub observer: ObserverConfig,
    pub controller: ControllerConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Budget groups processed in parallel
    pub max_concurrency: usize,

    /// API attempts per entry before it is abandoned
    pub max_attempts: u32,

    /// Budget denials per entry before it is abandoned
    pub max_budget_retries: u32,

    pub budget_requeue_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,

    /// How long in-flight evictions may finish after cancellation
    pub shutdown_grace_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_attempts: 5,
            max_budget_retries: 10,
            budget_requeue_secs: 5,
            backoff_base_ms: 200,
            backoff_max_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn budget_requeue_delay(&self) -> Duration {
        Duration::from_secs(self.budget_requeue_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Trailing window the failure ratio is computed over
    pub window_secs: u64,

    /// Failure ratio above which the breaker opens
    pub failure_threshold: f64,

    /// Samples required in the window before the ratio is trusted
    pub min_samples: usize,

    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            failure_threshold: 0.5,
            min_samples: 4,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Sustained eviction rate; zero or negative disables limiting
    pub evictions_per_second: f64,
    pub burst: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            evictions_per_second: 2.0,
            burst: 4,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Periodic full relist even when the watch is healthy
    pub resync_interval_secs: u64,

    /// Server-side watch timeout; must stay below 295 seconds
    pub watch_timeout_secs: u64,

    /// Pause after a failed list or watch before relisting
    pub retry_delay_secs: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 300,
            watch_timeout_secs: 290,
            retry_delay_secs: 2,
        }
    }
}

impl ObserverConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs.min(294))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub scan_interval_secs: u64,

    /// How long a node may stay NotReady/Unknown before it is drained
    pub node_not_ready_grace_secs: u64,

    /// Restarts after which a NotReady pod counts as unhealthy
    pub unhealthy_restart_threshold: i32,

    /// Cordon nodes before draining them
    pub cordon: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            node_not_ready_grace_secs: 300,
            unhealthy_restart_threshold: 5,
            cordon: true,
        }
    }
}

impl ControllerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn node_not_ready_grace(&self) -> Duration {
        Duration::from_secs(self.node_not_ready_grace_secs)
    }
}
