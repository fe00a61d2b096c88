//! Reconciliation engine for cadence Jobs
//!
//! - [`dispatcher`]: watches one resource kind, keeps its store current, and
//!   fans out typed change events to listeners in order
//! - [`coordinator`]: turns mutate-then-observe into a blocking call that
//!   returns a [`coordinator::CommandStatus`]
//! - [`job_coordinator`]: the "move Job J to state S" command
//! - [`conductor`]: the merged Job/Pod event loop driving each Job's state
//! - [`controller`]: creates and deletes Pods when a Job enters `POD_CREATION`
//! - [`factory`]: the mutations issued against the cluster

pub mod conductor;
pub mod controller;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod job_coordinator;
pub mod task;

#[cfg(test)]
mod testing;

pub use error::JobError;
