//! Build/probe joins.

mod table;
mod table_join;

pub use table::{default_table_factory, JoinTable, MultiKeyTable, TableFactory};
pub use table_join::TableJoin;
