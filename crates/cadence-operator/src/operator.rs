//! Component wiring and lifecycle
//!
//! Listener order on the Job dispatcher is significant: the coordinator sees
//! each change first so a blocked `update_state` is released before the
//! controller and the conductor react to the same change.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cadence_common::config::OperatorConfig;
use cadence_common::crd::Job;
use cadence_common::APP_LABEL_SELECTOR;
use cadence_job::conductor::JobConductor;
use cadence_job::controller::{JobController, PodController};
use cadence_job::coordinator::Coordinator;
use cadence_job::dispatcher::Dispatcher;
use cadence_job::factory::{KubeJobFactory, KubePodFactory};
use cadence_job::job_coordinator::JobCoordinator;
use cadence_job::task::TaskHandle;

struct Components {
    pods: Dispatcher<Pod>,
    jobs: Dispatcher<Job>,
    conductor: JobConductor,
}

/// The running operator: two dispatchers and the conductor
pub struct Operator {
    client: Client,
    namespace: String,
    shutdown: CancellationToken,
    components: Option<Components>,
    running: Vec<TaskHandle>,
}

impl Operator {
    /// Wire every component; nothing runs until [`Operator::start`]
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        let shutdown = CancellationToken::new();

        let mut pods = Dispatcher::<Pod>::new("Pod");
        let mut jobs = Dispatcher::<Job>::new("Job");
        let pod_store = pods.store();
        let job_store = jobs.store();

        let engine = Arc::new(Coordinator::new(config.command_timeout, shutdown.clone()));
        let coordinator = Arc::new(JobCoordinator::new(
            job_store.clone(),
            Arc::new(KubeJobFactory::new(client.clone())),
            Arc::clone(&engine),
        ));
        let controller = JobController::new(
            pod_store.clone(),
            Arc::new(KubePodFactory::new(client.clone(), pod_store.clone())),
            coordinator.clone(),
        );
        let (conductor, handle) = JobConductor::new(job_store, pod_store, coordinator, config.sweep);

        jobs.add_listener(engine);
        jobs.add_listener(Arc::new(controller));
        jobs.add_listener(Arc::new(handle.clone()));
        pods.add_listener(Arc::new(PodController));
        pods.add_listener(Arc::new(handle));

        Self {
            client,
            namespace: config.namespace.clone(),
            shutdown,
            components: Some(Components {
                pods,
                jobs,
                conductor,
            }),
            running: Vec::new(),
        }
    }

    /// Start the Pod watch, then the Job watch, then the conductor
    pub fn start(&mut self) -> anyhow::Result<()> {
        let Components {
            pods,
            jobs,
            conductor,
        } = self
            .components
            .take()
            .ok_or_else(|| anyhow::anyhow!("operator already started"))?;

        info!(namespace = %self.namespace, "starting operator");
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let job_api: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);

        let pod_watch = watcher::Config::default().labels(APP_LABEL_SELECTOR);
        self.running.push(pods.spawn(pod_api, pod_watch));
        self.running.push(jobs.spawn(job_api, watcher::Config::default()));
        self.running.push(conductor.spawn());
        Ok(())
    }

    /// Stop every component in reverse start order
    ///
    /// A component that fails to stop is logged and does not prevent the
    /// others from stopping. Safe to call more than once.
    pub async fn close(&mut self) {
        // pending commands must fail before the conductor is joined
        self.shutdown.cancel();
        while let Some(mut task) = self.running.pop() {
            if let Err(e) = task.close().await {
                error!(task = task.name(), error = %e, "failed to stop component");
            }
        }
        info!("operator stopped");
    }
}
