#![forbid(unsafe_code)]
//! pushq-exec: fork/join tasks on a fixed work-stealing pool.
//!
//! A [`Task`] is one closure with a tri-state completion. [`Pool::fork`]
//! queues it on the calling worker; [`Task::join`] waits for it, with pool
//! workers executing other queued work while they wait and foreign threads
//! blocking. [`Permits`] bound concurrent writers into shared consumers.

pub mod deque;
pub mod global;
pub mod metrics;
pub mod permits;
pub mod pool;
pub mod task;
mod worker;

pub use metrics::WorkerStatsSnapshot;
pub use permits::{PermitGuard, Permits};
pub use pool::{help_once, Pool};
pub use task::{Task, TaskStatus};
