#![forbid(unsafe_code)]
//! pushq-operators: push-based pipeline operators.
//!
//! Design intent:
//! - Operators are [`Block`]s that wire sinks together; execution happens
//!   when a producer pushes tuples through the sinks they create.
//! - Parallel work is forked onto the context's pool and always joined
//!   before the forking call returns.
//! - Sink forks define the merge order, so the root sees the same ordered
//!   output for any pool size.

pub mod bind;
pub mod block;
pub mod context;
pub mod expr;
pub mod join;
pub mod pipeline;
pub mod sink;

pub use bind::ForBind;
pub use block::{Block, BlockChain};
pub use context::QueryContext;
pub use expr::{Column, Expr, FnExpr, Items, Literal};
pub use join::{JoinTable, MultiKeyTable, TableFactory, TableJoin};
pub use pipeline::execute;
pub use sink::{ResultHandle, ResultSink, Sink};
