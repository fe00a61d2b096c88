//! Job-specific error types

use cadence_common::crd::JobState;

use crate::coordinator::CoordinatorError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] cadence_common::Error),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("job '{job}' did not converge to {state}")]
    CommandFailed { job: String, state: JobState },

    #[error("job '{job}' not found")]
    JobNotFound { job: String },

    #[error("command for job '{job}' finished without a status")]
    UnknownStatus { job: String },

    #[error("{kind} '{name}' has no {field}")]
    MissingMetadata {
        kind: &'static str,
        name: String,
        field: &'static str,
    },
}

impl JobError {
    /// Another command already holds the coordinator slot for this Job
    pub fn is_reentrant(&self) -> bool {
        matches!(self, Self::Coordinator(CoordinatorError::Reentrant { .. }))
    }

    pub(crate) fn missing(kind: &'static str, name: impl Into<String>, field: &'static str) -> Self {
        Self::MissingMetadata {
            kind,
            name: name.into(),
            field,
        }
    }
}
