//! Configuration file loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use remediate_engine::EngineConfig;

/// Used when `--config` is not given and the file exists
const DEFAULT_CONFIG: &str = "remediate.toml";

/// Slowest positive eviction rate: one eviction every 1000 seconds
const MIN_EVICTION_RATE: f64 = 0.001;

/// Load the engine configuration
///
/// An explicit path must exist. Without one, `./remediate.toml` is read if
/// present and built-in defaults are used otherwise.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.exists() {
                return Ok(EngineConfig::default());
            }
            default
        }
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn parse(content: &str) -> Result<EngineConfig> {
    let config: EngineConfig = toml::from_str(content)?;

    if !(0.0..=1.0).contains(&config.breaker.failure_threshold) {
        anyhow::bail!(
            "breaker.failure_threshold must be between 0 and 1, got {}",
            config.breaker.failure_threshold
        );
    }
    if config.executor.max_attempts == 0 {
        anyhow::bail!("executor.max_attempts must be at least 1");
    }

    // Zero or negative disables rate limiting
    let rate = config.rate.evictions_per_second;
    if !rate.is_finite() || (rate > 0.0 && rate < MIN_EVICTION_RATE) {
        anyhow::bail!(
            "rate.evictions_per_second must be a number of at least {} (or 0 to disable), got {}",
            MIN_EVICTION_RATE,
            rate
        );
    }
    Ok(config)
}
