//! Engine configuration.
//!
//! Settings live in `~/.taskmesh/taskmesh.toml`, one table per component.
//! Missing tables and keys take their defaults, and every load is checked
//! by [`Config::validate`] before an engine sees it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::consensus::ConsensusConfig;
use crate::orchestration::balancer::LoadBalancerConfig;
use crate::orchestration::breaker::CircuitBreakerConfig;
use crate::orchestration::stealing::WorkStealingConfig;
use crate::{Error, Result};

/// Engine configuration, one section per component.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub work_stealing: WorkStealingConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

impl Config {
    pub fn taskmesh_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskmesh"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::taskmesh_dir()?.join("taskmesh.toml"))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Config::load path={}", path.display());
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        debug!(
            "Config loaded: strategy={:?}, steal_threshold={}, failure_threshold={}, algorithm={:?}",
            config.load_balancer.strategy,
            config.work_stealing.steal_threshold,
            config.circuit_breaker.failure_threshold,
            config.consensus.default_algorithm
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("cannot serialize config: {}", e)))?;
        fs::write(path, body)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make a component misbehave.
    pub fn validate(&self) -> Result<()> {
        let ws = &self.work_stealing;
        if ws.steal_threshold == 0 {
            return Err(Error::InvalidConfig(
                "work_stealing.steal_threshold must be at least 1".to_string(),
            ));
        }
        if ws.max_steal_batch == 0 {
            return Err(Error::InvalidConfig(
                "work_stealing.max_steal_batch must be at least 1".to_string(),
            ));
        }

        let lb = &self.load_balancer;
        if lb.weights.total() <= 0.0 {
            return Err(Error::InvalidConfig(
                "load_balancer.weights must sum to a positive value".to_string(),
            ));
        }
        if lb.max_tasks_per_agent == 0 {
            return Err(Error::InvalidConfig(
                "load_balancer.max_tasks_per_agent must be at least 1".to_string(),
            ));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.half_open_limit == 0 {
            return Err(Error::InvalidConfig(
                "circuit_breaker thresholds and half_open_limit must be at least 1".to_string(),
            ));
        }
        if cb.success_threshold > cb.half_open_limit {
            return Err(Error::InvalidConfig(format!(
                "circuit_breaker.success_threshold ({}) cannot exceed half_open_limit ({})",
                cb.success_threshold, cb.half_open_limit
            )));
        }

        let cs = &self.consensus;
        if !(cs.default_threshold > 0.0 && cs.default_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "consensus.default_threshold must be in (0, 1], got {}",
                cs.default_threshold
            )));
        }
        if cs.gossip_fanout == 0 {
            return Err(Error::InvalidConfig(
                "consensus.gossip_fanout must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
