#![forbid(unsafe_code)]
//! pushq-core: values, tuples, comparison kinds, typed ids, configuration and
//! the engine-wide error type.
//!
//! Everything here is pure data. Scheduling lives in `pushq-exec`, the sink
//! and block protocols in `pushq-operators`.

pub mod cmp;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod tuple;
pub mod types;

pub use error::{Error, Result};
pub use cmp::Cmp;
pub use config::EngineConfig;
pub use id::{SinkId, TaskId, WorkerId};
pub use tuple::Tuple;
pub use types::Scalar;
