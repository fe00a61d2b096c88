//! Job and Pod controllers
//!
//! [`JobController`] reacts to Job state notifications: it starts the
//! `UNDEFINED -> POD_CREATION` handshake for Jobs first seen in `UNDEFINED`
//! (a Job already past it, e.g. after a restart, is left as it is) and, on every
//! transition into `POD_CREATION`, creates or deletes Pods until the observed
//! count matches `desired`.
//!
//! Scale-down removes the newest Pods first, ordered by creation timestamp
//! and then by name, so the choice is deterministic for a given Pod set.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error, info};

use cadence_common::crd::{Job, JobState};
use cadence_common::retry::{retry_while, RetryConfig};
use cadence_common::{ChangeEvent, Store, JOB_LABEL_KEY};

use crate::dispatcher::EventListener;
use crate::factory::PodFactory;
use crate::job_coordinator::JobStateUpdater;
use crate::JobError;

/// Pod mutations needed to match a Job's `desired` count
#[derive(Clone, Debug, PartialEq)]
pub enum PodPlan {
    Create(u32),
    Delete(Vec<Pod>),
    Nothing,
}

/// Compare `desired` against the Pods correlated to the Job
pub fn plan(desired: u32, mut pods: Vec<Pod>) -> PodPlan {
    let desired = desired as usize;
    if pods.len() < desired {
        // bounded by desired, which is a u32
        return PodPlan::Create((desired - pods.len()) as u32);
    }
    if pods.len() == desired {
        return PodPlan::Nothing;
    }
    pods.sort_by(|a, b| {
        let age = |p: &Pod| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
        age(a).cmp(&age(b)).then_with(|| a.name_any().cmp(&b.name_any()))
    });
    PodPlan::Delete(pods.split_off(desired))
}

/// Creates and deletes Pods when a Job enters `POD_CREATION`
pub struct JobController {
    pods: Store<Pod>,
    factory: Arc<dyn PodFactory>,
    updater: Arc<dyn JobStateUpdater>,
    retry: RetryConfig,
}

impl JobController {
    pub fn new(
        pods: Store<Pod>,
        factory: Arc<dyn PodFactory>,
        updater: Arc<dyn JobStateUpdater>,
    ) -> Self {
        Self {
            pods,
            factory,
            updater,
            retry: RetryConfig::default(),
        }
    }

    /// Backoff used while the handshake waits for a busy coordinator slot
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Move a newly seen Job to `POD_CREATION` without blocking dispatch
    fn start_handshake(&self, job: Job) {
        let updater = Arc::clone(&self.updater);
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let name = job.name_any();
            let result = retry_while(&retry, "job-handshake", JobError::is_reentrant, || {
                updater.update_state(&job, JobState::PodCreation)
            })
            .await;
            if let Err(e) = result {
                error!(job = %name, error = %e, "failed to move job to POD_CREATION");
            }
        });
    }

    async fn provision(&self, job: &Job) {
        let name = job.name_any();
        let pods = self.pods.with_label(JOB_LABEL_KEY, &name);

        match plan(job.spec.desired, pods) {
            PodPlan::Create(count) => {
                debug!(job = %name, count, "Add {} pod(s)", count);
                let results = join_all((0..count).map(|_| self.factory.create(job))).await;
                for err in results.into_iter().filter_map(Result::err) {
                    error!(job = %name, error = %err, "failed to create pod");
                }
            }
            PodPlan::Delete(victims) => {
                debug!(job = %name, count = victims.len(), "Delete {} pod(s)", victims.len());
                let results = join_all(victims.iter().map(|pod| self.factory.delete(pod))).await;
                for (pod, result) in victims.iter().zip(results) {
                    if let Err(e) = result {
                        error!(job = %name, pod = %pod.name_any(), error = %e, "failed to delete pod");
                    }
                }
            }
            PodPlan::Nothing => debug!(job = %name, "pod count already matches"),
        }
    }
}

#[async_trait]
impl EventListener<Job> for JobController {
    async fn on_event(&self, event: &ChangeEvent<Job>) {
        let name = event.name();
        match event {
            ChangeEvent::Addition(job) => {
                info!(job = %name, "ADD - {}", name);
                if job.spec.state == JobState::Undefined {
                    self.start_handshake(job.clone());
                } else {
                    debug!(job = %name, state = %job.spec.state, "job already past UNDEFINED");
                }
            }
            ChangeEvent::Modification { prior, current } => {
                if prior.spec.state == current.spec.state {
                    return;
                }
                info!(job = %name, from = %prior.spec.state, to = %current.spec.state, "MOD - {}", name);
                match current.spec.state {
                    JobState::Undefined => {
                        error!(job = %name, "job moved back to UNDEFINED");
                    }
                    JobState::PodCreation => self.provision(current).await,
                    JobState::Ready => debug!(job = %name, "job is READY"),
                }
            }
            ChangeEvent::Deletion(_) => info!(job = %name, "DEL - {}", name),
        }
    }
}

/// Logs Pod lifecycle events
#[derive(Clone, Copy, Debug, Default)]
pub struct PodController;

#[async_trait]
impl EventListener<Pod> for PodController {
    async fn on_event(&self, event: &ChangeEvent<Pod>) {
        let name = event.name();
        let job = event
            .resource()
            .labels()
            .get(JOB_LABEL_KEY)
            .cloned()
            .unwrap_or_default();
        info!(pod = %name, %job, "{} - {}", event.verb(), name);
    }
}
