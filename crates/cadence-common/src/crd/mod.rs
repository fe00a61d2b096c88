//! Custom Resource Definitions for cadence

mod job;

pub use job::{Job, JobSpec, JobState};
