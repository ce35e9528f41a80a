//! Runtime configuration

use std::time::Duration;

use evma_core::env::env_get;

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Seconds an above-floor worker waits for a job before exiting
    pub pool_delay: Duration,

    /// Worker threads that never self-terminate
    pub pool_min: usize,

    /// Hard cap on live worker threads
    pub pool_max: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_delay: Duration::from_secs(10),
            pool_min: 0,
            pool_max: usize::MAX,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `EVMA_POOL_DELAY` / `EVMA_POOL_MIN` /
    /// `EVMA_POOL_MAX`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            pool_delay: Duration::from_secs(env_get("EVMA_POOL_DELAY", d.pool_delay.as_secs())),
            pool_min: env_get("EVMA_POOL_MIN", d.pool_min),
            pool_max: env_get("EVMA_POOL_MAX", d.pool_max),
        }
    }

    /// Set the worker idle timeout
    pub fn pool_delay(mut self, d: Duration) -> Self {
        self.pool_delay = d;
        self
    }

    /// Set the worker floor
    pub fn pool_min(mut self, n: usize) -> Self {
        self.pool_min = n;
        self
    }

    /// Set the worker cap
    pub fn pool_max(mut self, n: usize) -> Self {
        self.pool_max = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pool_max == 0 {
            return Err("pool_max must be at least 1");
        }
        if self.pool_max < self.pool_min {
            return Err("pool_max must not be below pool_min");
        }
        Ok(())
    }
}
