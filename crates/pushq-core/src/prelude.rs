//! Convenient re-exports for downstream crates.

pub use crate::cmp::Cmp;
pub use crate::config::EngineConfig;
pub use crate::error::{Error, Result};
pub use crate::id::{SinkId, TaskId, WorkerId};
pub use crate::tuple::Tuple;
pub use crate::types::Scalar;
