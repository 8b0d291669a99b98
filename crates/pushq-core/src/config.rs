//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads in the shared pool. Defaults to the number of CPUs.
    pub pool_size: usize,

    /// Items a ForBind slice buffers before it forks a continuation.
    pub fork_buffer_size: usize,

    /// Batch length at or below which ForBind binds sequentially instead of
    /// splitting the batch across tasks.
    pub sequential_threshold: usize,

    /// Concurrent out-of-order writers admitted by an order-preserving sink,
    /// and concurrent loaders of a join table when order is not required.
    pub output_permits: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().max(1),
            fork_buffer_size: 20,
            sequential_threshold: 10,
            output_permits: 8,
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `PUSHQ_POOL_SIZE`: worker threads
    /// - `PUSHQ_FORK_BUFFER`: ForBind slice buffer size
    /// - `PUSHQ_SEQUENTIAL_THRESHOLD`: sequential bind threshold
    /// - `PUSHQ_OUTPUT_PERMITS`: out-of-order writer permits
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_usize("PUSHQ_POOL_SIZE") {
            cfg.pool_size = v;
        }

        if let Some(v) = env_usize("PUSHQ_FORK_BUFFER") {
            cfg.fork_buffer_size = v;
        }

        if let Some(v) = env_usize("PUSHQ_SEQUENTIAL_THRESHOLD") {
            cfg.sequential_threshold = v;
        }

        if let Some(v) = env_usize("PUSHQ_OUTPUT_PERMITS") {
            cfg.output_permits = v;
        }

        cfg
    }

    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: EngineConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.fork_buffer_size == 0 {
            return Err(Error::Config("fork_buffer_size must be at least 1".into()));
        }
        if self.sequential_threshold == 0 {
            return Err(Error::Config("sequential_threshold must be at least 1".into()));
        }
        if self.output_permits == 0 {
            return Err(Error::Config("output_permits must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse::<usize>().ok()
}
