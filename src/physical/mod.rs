//! Physical plan module
//!
//! Operator trees produced by the plan builder, statement roots, and
//! structural checks over finished plans

mod display;
mod plan;
mod root;
mod validate;

pub use plan::*;
pub use root::*;
pub use validate::validate_spools;
