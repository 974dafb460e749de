//! Query planner module
//!
//! Binds T-SQL syntax trees to physical plans

mod builder;
mod collation;
mod logical_expr;
mod schema;

pub use builder::PlanBuilder;
pub use collation::*;
pub use logical_expr::*;
pub use schema::*;
