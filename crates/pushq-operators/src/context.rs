//! Per-query execution context.

use std::sync::Arc;

use pushq_core::{EngineConfig, Result};
use pushq_exec::{global, Pool};

/// What every block and task of one query shares: the pool plus the
/// tuning knobs operators read when they decide how to split work.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub pool: Arc<Pool>,
    /// Items a bind slice buffers before forking a continuation.
    pub fork_buffer: usize,
    /// Batches at or below this length are bound without splitting.
    pub seq_threshold: usize,
    /// Out-of-order writers admitted by order-preserving sinks.
    pub output_permits: usize,
}

impl QueryContext {
    /// Context on `pool` with default knobs, or the process-wide ones where
    /// set.
    pub fn new(pool: Arc<Pool>) -> Self {
        let d = EngineConfig::default();
        Self {
            pool,
            fork_buffer: global::fork_buffer().unwrap_or(d.fork_buffer_size),
            seq_threshold: d.sequential_threshold,
            output_permits: global::output_permits().unwrap_or(d.output_permits),
        }
    }

    /// Context on the process-wide pool with knobs from `cfg`. Process-wide
    /// knobs, where set, override the config's.
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            pool: global::pool()?,
            fork_buffer: global::fork_buffer().unwrap_or(cfg.fork_buffer_size),
            seq_threshold: cfg.sequential_threshold,
            output_permits: global::output_permits().unwrap_or(cfg.output_permits),
        })
    }

    pub fn with_fork_buffer(mut self, n: usize) -> Self {
        self.fork_buffer = n.max(1);
        self
    }

    pub fn with_seq_threshold(mut self, n: usize) -> Self {
        self.seq_threshold = n.max(1);
        self
    }

    pub fn with_output_permits(mut self, n: usize) -> Self {
        self.output_permits = n.max(1);
        self
    }

    /// Rows an order-preserving sink may hold behind its head: one bind
    /// buffer per permit.
    pub fn buffer_limit(&self) -> usize {
        self.output_permits.max(1) * self.fork_buffer.max(1)
    }
}
