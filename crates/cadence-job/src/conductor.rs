//! The Job conductor: one loop over a merged Job/Pod event queue
//!
//! Both dispatchers forward their events into the same unbounded queue
//! through a [`ConductorHandle`]. The conductor pulls them one at a time, in
//! arrival order, correlates each Pod event to a registered Job through the
//! `cadence.dev/job` label, and advances that Job's state machine:
//!
//! ```text
//! UNDEFINED --(Job says POD_CREATION)--> POD_CREATION --(pods == desired)--> READY
//! ```
//!
//! A change of `desired`, or the deletion of a correlated Pod, forces the Job
//! back to `POD_CREATION`. Unmet preconditions are reported as
//! [`Progress::NotReady`] and retried on the next relevant event.
//!
//! The sweep timeout on the queue pull only keeps the loop live; an idle
//! sweep takes no action. A transition refused because another command holds
//! the Job's coordinator slot is retried with backoff, since the event that
//! asked for it will not be delivered again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use cadence_common::crd::{Job, JobState};
use cadence_common::retry::{retry_while, RetryConfig};
use cadence_common::{ChangeEvent, Store, JOB_LABEL_KEY};

use crate::dispatcher::EventListener;
use crate::job_coordinator::JobStateUpdater;
use crate::task::TaskHandle;
use crate::JobError;

/// One entry of the merged queue
#[derive(Clone, Debug)]
pub enum ConductorEvent {
    Job(ChangeEvent<Job>),
    Pod(ChangeEvent<Pod>),
}

/// Listener that forwards dispatcher events into the conductor queue
#[derive(Clone)]
pub struct ConductorHandle {
    tx: mpsc::UnboundedSender<ConductorEvent>,
}

impl ConductorHandle {
    fn forward(&self, event: ConductorEvent) {
        if self.tx.send(event).is_err() {
            debug!("conductor stopped, dropping event");
        }
    }
}

#[async_trait]
impl EventListener<Job> for ConductorHandle {
    async fn on_event(&self, event: &ChangeEvent<Job>) {
        self.forward(ConductorEvent::Job(event.clone()));
    }
}

#[async_trait]
impl EventListener<Pod> for ConductorHandle {
    async fn on_event(&self, event: &ChangeEvent<Pod>) {
        self.forward(ConductorEvent::Pod(event.clone()));
    }
}

/// Result of handling one queue entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// At least one state transition was issued
    Advanced,
    /// Nothing to do
    Settled,
    /// Preconditions unmet; wait for the next relevant event
    NotReady,
    /// The event did not correlate to a registered Job
    Ignored,
}

enum Step {
    Next(JobState),
    Done,
    NotReady,
}

#[derive(Clone, Copy)]
enum Trigger<'a> {
    Job(&'a Job),
    Pod(&'a Pod),
}

impl Trigger<'_> {
    fn describe(&self) -> String {
        match self {
            Self::Job(job) => format!("Job/{}", job.name_any()),
            Self::Pod(pod) => format!("Pod/{}", pod.name_any()),
        }
    }
}

pub struct JobConductor {
    jobs: Store<Job>,
    pods: Store<Pod>,
    updater: Arc<dyn JobStateUpdater>,
    registry: HashSet<String>,
    queue: mpsc::UnboundedReceiver<ConductorEvent>,
    sweep: Duration,
    retry: RetryConfig,
}

impl JobConductor {
    /// Create a conductor and the handle its dispatchers publish into
    pub fn new(
        jobs: Store<Job>,
        pods: Store<Pod>,
        updater: Arc<dyn JobStateUpdater>,
        sweep: Duration,
    ) -> (Self, ConductorHandle) {
        let (tx, queue) = mpsc::unbounded_channel();
        let conductor = Self {
            jobs,
            pods,
            updater,
            registry: HashSet::new(),
            queue,
            sweep,
            retry: RetryConfig::default(),
        };
        (conductor, ConductorHandle { tx })
    }

    /// Backoff used while a transition waits for a busy coordinator slot
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_registered(&self, job: &str) -> bool {
        self.registry.contains(job)
    }

    pub fn spawn(self) -> TaskHandle {
        let cancel = CancellationToken::new();
        TaskHandle::spawn("conductor", cancel.clone(), self.run(cancel))
    }

    /// Process queue entries until cancelled or every handle is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(sweep_ms = self.sweep.as_millis() as u64, "conductor started");
        while !cancel.is_cancelled() {
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                pulled = tokio::time::timeout(self.sweep, self.queue.recv()) => pulled,
            };
            let event = match pulled {
                Err(_) => continue,
                Ok(None) => {
                    debug!("conductor queue closed");
                    break;
                }
                Ok(Some(event)) => event,
            };
            match self.handle(event).await {
                Ok(progress) => trace!(?progress, "event handled"),
                Err(e) => error!(error = %e, "job reconciliation failed"),
            }
        }
        info!("conductor stopped");
    }

    /// Handle one queue entry
    pub async fn handle(&mut self, event: ConductorEvent) -> Result<Progress, JobError> {
        match event {
            ConductorEvent::Job(change) => self.handle_job(change).await,
            ConductorEvent::Pod(change) => self.handle_pod(change).await,
        }
    }

    async fn handle_job(&mut self, change: ChangeEvent<Job>) -> Result<Progress, JobError> {
        match change {
            ChangeEvent::Addition(job) => {
                self.registry.insert(job.name_any());
                Ok(Progress::Settled)
            }
            ChangeEvent::Deletion(job) => {
                self.registry.remove(&job.name_any());
                Ok(Progress::Settled)
            }
            ChangeEvent::Modification { prior, current } => {
                let mut job = current.clone();
                if prior.spec.desired != current.spec.desired {
                    info!(
                        job = %current.name_any(),
                        from = prior.spec.desired,
                        to = current.spec.desired,
                        "desired changed, re-provisioning"
                    );
                    job = self.reset(&current).await?;
                }
                self.process(&job, Trigger::Job(&current)).await
            }
        }
    }

    async fn handle_pod(&mut self, change: ChangeEvent<Pod>) -> Result<Progress, JobError> {
        let Some(job) = self.owner_of(change.resource()) else {
            return Ok(Progress::Ignored);
        };
        match &change {
            ChangeEvent::Addition(pod) => self.process(&job, Trigger::Pod(pod)).await,
            ChangeEvent::Modification { .. } => Ok(Progress::Settled),
            ChangeEvent::Deletion(pod) => {
                debug!(job = %job.name_any(), pod = %pod.name_any(), "pod lost, re-provisioning");
                let job = self.reset(&job).await?;
                self.process(&job, Trigger::Pod(pod)).await
            }
        }
    }

    async fn transition(&self, job: &Job, state: JobState) -> Result<(), JobError> {
        retry_while(&self.retry, "conductor-transition", JobError::is_reentrant, || {
            self.updater.update_state(job, state)
        })
        .await
    }

    /// Send `job` back to `POD_CREATION`; returns the Job as stored afterwards
    async fn reset(&self, job: &Job) -> Result<Job, JobError> {
        self.transition(job, JobState::PodCreation).await?;
        let name = job.name_any();
        self.jobs
            .get(&name)
            .ok_or(JobError::JobNotFound { job: name })
    }

    /// The registered Job a Pod belongs to
    fn owner_of(&self, pod: &Pod) -> Option<Job> {
        let Some(name) = pod.labels().get(JOB_LABEL_KEY) else {
            trace!(pod = %pod.name_any(), "pod has no job label");
            return None;
        };
        if !self.registry.contains(name) {
            trace!(pod = %pod.name_any(), job = %name, "job not registered");
            return None;
        }
        self.jobs.get(name)
    }

    #[instrument(skip_all, fields(job = %job.name_any(), trigger = %trigger.describe()))]
    async fn process(&self, job: &Job, trigger: Trigger<'_>) -> Result<Progress, JobError> {
        let mut state = job.spec.state;
        if state.is_terminal() {
            return Ok(Progress::Settled);
        }

        let mut advanced = false;
        loop {
            match self.advance(job, state, trigger).await? {
                Step::Next(next) => {
                    advanced |= next == JobState::Ready;
                    state = next;
                }
                Step::NotReady => return Ok(Progress::NotReady),
                Step::Done if advanced => return Ok(Progress::Advanced),
                Step::Done => return Ok(Progress::Settled),
            }
        }
    }

    async fn advance(&self, job: &Job, state: JobState, trigger: Trigger<'_>) -> Result<Step, JobError> {
        match state {
            JobState::Undefined => match trigger {
                Trigger::Job(declared) if declared.spec.state >= JobState::PodCreation => {
                    Ok(Step::Next(JobState::PodCreation))
                }
                _ => Ok(Step::NotReady),
            },
            JobState::PodCreation => {
                let observed = self
                    .pods
                    .count_with_label(JOB_LABEL_KEY, &job.name_any());
                if observed != job.spec.desired as usize {
                    trace!(observed, desired = job.spec.desired, "pod count not yet matched");
                    return Ok(Step::NotReady);
                }
                self.transition(job, JobState::Ready).await?;
                info!(job = %job.name_any(), pods = observed, "job is READY");
                Ok(Step::Next(JobState::Ready))
            }
            JobState::Ready => Ok(Step::Done),
        }
    }
}
