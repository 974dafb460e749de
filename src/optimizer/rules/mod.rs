//! Optimizer rules

mod correlated_spool;

pub use correlated_spool::CorrelatedSpoolInsertion;
