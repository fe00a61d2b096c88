//! Cadence operator: wiring and startup for the Job reconciliation engine

pub mod operator;
pub mod startup;

pub use operator::Operator;
