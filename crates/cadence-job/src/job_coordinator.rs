//! "Move Job J to state S" on top of the coordinator

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error};

use cadence_common::crd::{Job, JobState};
use cadence_common::Store;

use crate::coordinator::{Action, Command, CommandStatus, Coordinator};
use crate::factory::JobFactory;
use crate::JobError;

/// Drives a Job to a state and reports whether it got there
///
/// `Ok(())` covers both "converged" and "was already there".
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobStateUpdater: Send + Sync {
    async fn update_state(&self, job: &Job, state: JobState) -> Result<(), JobError>;
}

struct UpdateStateCommand<'a> {
    job_name: String,
    state: JobState,
    jobs: &'a Store<Job>,
    factory: &'a dyn JobFactory,
}

#[async_trait]
impl Command<Job> for UpdateStateCommand<'_> {
    async fn run(&self) -> Action {
        let Some(job) = self.jobs.get(&self.job_name) else {
            debug!(job = %self.job_name, "job not in store");
            return Action::Remove(CommandStatus::JobNotFound);
        };
        if job.spec.state == self.state {
            return Action::Remove(CommandStatus::NoChangeNeeded);
        }
        match self.factory.update_state(&job, self.state).await {
            Ok(()) => Action::Wait,
            Err(e) => {
                error!(job = %self.job_name, state = %self.state, error = %e, "failed to patch job state");
                Action::Remove(CommandStatus::Failure)
            }
        }
    }

    // state has a single writer, so the next modification is our own patch
    fn check(&self, _prior: &Job, current: &Job) -> bool {
        current.spec.state == self.state
    }
}

/// State transitions for Jobs, serialized per Job through one [`Coordinator`]
pub struct JobCoordinator {
    jobs: Store<Job>,
    factory: Arc<dyn JobFactory>,
    engine: Arc<Coordinator<Job>>,
}

impl JobCoordinator {
    pub fn new(jobs: Store<Job>, factory: Arc<dyn JobFactory>, engine: Arc<Coordinator<Job>>) -> Self {
        Self {
            jobs,
            factory,
            engine,
        }
    }

    /// The engine, to be registered as a listener on the Job dispatcher
    pub fn engine(&self) -> Arc<Coordinator<Job>> {
        Arc::clone(&self.engine)
    }

    /// Run the transition and return the raw status
    pub async fn submit(&self, job: &Job, state: JobState) -> Result<CommandStatus, JobError> {
        let command = UpdateStateCommand {
            job_name: job.name_any(),
            state,
            jobs: &self.jobs,
            factory: self.factory.as_ref(),
        };
        Ok(self.engine.apply(job, &command).await?)
    }
}

/// Map a command status onto the caller-facing result
pub fn status_to_result(job: &str, state: JobState, status: CommandStatus) -> Result<(), JobError> {
    match status {
        CommandStatus::Success | CommandStatus::NoChangeNeeded => Ok(()),
        CommandStatus::Failure => Err(JobError::CommandFailed {
            job: job.to_string(),
            state,
        }),
        CommandStatus::JobNotFound => Err(JobError::JobNotFound {
            job: job.to_string(),
        }),
        CommandStatus::Unknown => {
            error!(job, %state, "command finished with status Unknown");
            Err(JobError::UnknownStatus {
                job: job.to_string(),
            })
        }
    }
}

#[async_trait]
impl JobStateUpdater for JobCoordinator {
    async fn update_state(&self, job: &Job, state: JobState) -> Result<(), JobError> {
        let status = self.submit(job, state).await?;
        status_to_result(&job.name_any(), state, status)
    }
}
