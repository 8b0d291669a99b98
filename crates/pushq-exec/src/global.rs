//! Process-wide pool.
//!
//! Created lazily from [`EngineConfig::from_env`]. `set_pool_size` swaps in a
//! fresh pool; queries already holding the old one finish on it, and it shuts
//! down when its last handle drops.
//!
//! The bind buffer size and the output permits can be fixed process-wide as
//! well; when set they win over per-query configuration, the same way the
//! shared pool does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use pushq_core::{EngineConfig, Error, Result};
use tracing::debug;

use crate::pool::Pool;

static GLOBAL: Lazy<RwLock<Option<Arc<Pool>>>> = Lazy::new(|| RwLock::new(None));

// Zero means unset.
static FORK_BUFFER: AtomicUsize = AtomicUsize::new(0);
static OUTPUT_PERMITS: AtomicUsize = AtomicUsize::new(0);

/// The shared pool, creating it on first use.
pub fn pool() -> Result<Arc<Pool>> {
    if let Some(p) = GLOBAL.read().as_ref() {
        return Ok(Arc::clone(p));
    }
    let mut slot = GLOBAL.write();
    if let Some(p) = slot.as_ref() {
        return Ok(Arc::clone(p));
    }
    let mut cfg = EngineConfig::from_env();
    if cfg.validate().is_err() {
        cfg.pool_size = EngineConfig::default().pool_size;
    }
    let p = Arc::new(Pool::new(cfg.pool_size)?);
    *slot = Some(Arc::clone(&p));
    Ok(p)
}

/// Replace the shared pool with one of `size` workers.
pub fn set_pool_size(size: usize) -> Result<()> {
    let fresh = Arc::new(Pool::new(size)?);
    let old = GLOBAL.write().replace(fresh);
    debug!(size, "global pool replaced");
    // Dropped outside the lock; shuts down unless a query still holds it.
    drop(old);
    Ok(())
}

pub fn pool_size() -> Result<usize> {
    pool().map(|p| p.size())
}

fn set_knob(knob: &AtomicUsize, name: &str, n: usize) -> Result<()> {
    if n == 0 {
        return Err(Error::Config(format!("{name} must be at least 1")));
    }
    knob.store(n, Ordering::Release);
    debug!(n, "global {name} set");
    Ok(())
}

fn knob(knob: &AtomicUsize) -> Option<usize> {
    match knob.load(Ordering::Acquire) {
        0 => None,
        n => Some(n),
    }
}

/// Items a bind slice buffers before forking, for every query from now on.
pub fn set_fork_buffer(n: usize) -> Result<()> {
    set_knob(&FORK_BUFFER, "fork_buffer", n)
}

/// The process-wide bind buffer size, if one was set.
pub fn fork_buffer() -> Option<usize> {
    knob(&FORK_BUFFER)
}

/// Out-of-order writer permits of order-preserving sinks, for every query
/// from now on.
pub fn set_output_permits(n: usize) -> Result<()> {
    set_knob(&OUTPUT_PERMITS, "output_permits", n)
}

pub fn output_permits() -> Option<usize> {
    knob(&OUTPUT_PERMITS)
}
