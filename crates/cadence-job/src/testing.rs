//! In-memory cluster for end-to-end tests
//!
//! [`FakeCluster`] plays the API server: it owns the authoritative Job and
//! Pod objects, stamps a fresh `resourceVersion` on every write, and emits
//! the matching watch events on two streams. [`Harness`] wires the real
//! dispatchers, coordinator, controllers and conductor on top of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use cadence_common::crd::{Job, JobSpec, JobState};
use cadence_common::Store;

use crate::conductor::JobConductor;
use crate::controller::{JobController, PodController};
use crate::coordinator::Coordinator;
use crate::dispatcher::Dispatcher;
use crate::factory::{build_pod, JobFactory, PodFactory};
use crate::job_coordinator::JobCoordinator;
use crate::task::TaskHandle;
use crate::JobError;

pub(crate) const NAMESPACE: &str = "default";

type WatchTx<K> = mpsc::UnboundedSender<Result<watcher::Event<K>, watcher::Error>>;
type WatchStream<K> = UnboundedReceiverStream<Result<watcher::Event<K>, watcher::Error>>;

pub(crate) struct FakeCluster {
    jobs: Mutex<HashMap<String, Job>>,
    pods: Mutex<HashMap<String, Pod>>,
    job_tx: WatchTx<Job>,
    pod_tx: WatchTx<Pod>,
    version: AtomicU64,
    pub(crate) creates: AtomicU32,
    pub(crate) deletes: AtomicU32,
    pub(crate) patches: AtomicU32,
}

impl FakeCluster {
    pub(crate) fn new() -> (Arc<Self>, WatchStream<Job>, WatchStream<Pod>) {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (pod_tx, pod_rx) = mpsc::unbounded_channel();
        let cluster = Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            pods: Mutex::new(HashMap::new()),
            job_tx,
            pod_tx,
            version: AtomicU64::new(1),
            creates: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
            patches: AtomicU32::new(0),
        });
        (
            cluster,
            UnboundedReceiverStream::new(job_rx),
            UnboundedReceiverStream::new(pod_rx),
        )
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn write_job(&self, mut job: Job) {
        job.metadata.resource_version = Some(self.next_version());
        self.jobs.lock().insert(job.name_any(), job.clone());
        let _ = self.job_tx.send(Ok(watcher::Event::Apply(job)));
    }

    fn write_pod(&self, mut pod: Pod) {
        pod.metadata.resource_version = Some(self.next_version());
        self.pods.lock().insert(pod.name_any(), pod.clone());
        let _ = self.pod_tx.send(Ok(watcher::Event::Apply(pod)));
    }

    fn remove_pod(&self, name: &str) -> bool {
        let Some(pod) = self.pods.lock().remove(name) else {
            return false;
        };
        let _ = self.pod_tx.send(Ok(watcher::Event::Delete(pod)));
        true
    }

    /// A user declares a new Job
    pub(crate) fn create_job(&self, name: &str, desired: u32) {
        let mut job = Job::new(name, JobSpec::new("busybox:1.36", desired));
        job.metadata.namespace = Some(NAMESPACE.to_string());
        job.metadata.uid = Some(format!("uid-{}", name));
        self.write_job(job);
    }

    /// A Job that converged before the operator (re)started, with its Pods
    pub(crate) fn seed_ready_job(&self, name: &str, pods: u32) -> Result<(), JobError> {
        let mut job = Job::new(name, JobSpec::new("busybox:1.36", pods));
        job.metadata.namespace = Some(NAMESPACE.to_string());
        job.metadata.uid = Some(format!("uid-{}", name));
        job.spec.state = JobState::Ready;
        for n in 0..pods {
            self.write_pod(build_pod(&job, &format!("{}-seed{}", name, n))?);
        }
        self.write_job(job);
        Ok(())
    }

    /// A user edits `desired`
    pub(crate) fn scale_job(&self, name: &str, desired: u32) {
        let Some(mut job) = self.jobs.lock().get(name).cloned() else {
            return;
        };
        job.spec.desired = desired;
        self.write_job(job);
    }

    /// A user deletes a Job; its Pods are garbage collected after it
    pub(crate) fn delete_job(&self, name: &str) {
        let Some(job) = self.jobs.lock().remove(name) else {
            return;
        };
        let _ = self.job_tx.send(Ok(watcher::Event::Delete(job)));
        let owned: Vec<String> = self
            .pods
            .lock()
            .values()
            .filter(|p| p.labels().get(cadence_common::JOB_LABEL_KEY).map(String::as_str) == Some(name))
            .map(|p| p.name_any())
            .collect();
        for pod in owned {
            self.remove_pod(&pod);
        }
    }

    /// A Pod disappears without the controller asking for it
    pub(crate) fn evict_pod(&self, name: &str) -> bool {
        self.remove_pod(name)
    }

    /// Any pod of this job currently in the cluster
    pub(crate) fn any_pod_of(&self, job: &str) -> Option<String> {
        self.pods
            .lock()
            .values()
            .find(|p| p.labels().get(cadence_common::JOB_LABEL_KEY).map(String::as_str) == Some(job))
            .map(|p| p.name_any())
    }
}

#[async_trait]
impl JobFactory for FakeCluster {
    async fn update_state(&self, job: &Job, state: JobState) -> Result<(), JobError> {
        let name = job.name_any();
        let Some(mut stored) = self.jobs.lock().get(&name).cloned() else {
            return Err(JobError::JobNotFound { job: name });
        };
        self.patches.fetch_add(1, Ordering::SeqCst);
        stored.spec.state = state;
        self.write_job(stored);
        Ok(())
    }
}

#[async_trait]
impl PodFactory for FakeCluster {
    async fn create(&self, job: &Job) -> Result<String, JobError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{:05}", job.name_any(), n);
        let pod = build_pod(job, &name)?;
        self.write_pod(pod);
        Ok(name)
    }

    async fn delete(&self, pod: &Pod) -> Result<(), JobError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.remove_pod(&pod.name_any());
        Ok(())
    }
}

/// Everything the operator runs, over a [`FakeCluster`]
pub(crate) struct Harness {
    pub(crate) cluster: Arc<FakeCluster>,
    pub(crate) jobs: Store<Job>,
    pub(crate) pods: Store<Pod>,
    shutdown: CancellationToken,
    tasks: Vec<TaskHandle>,
}

impl Harness {
    pub(crate) fn start() -> Self {
        Self::start_with(|_| {})
    }

    /// Start after `seed` has populated the cluster; the components see its
    /// objects as Additions, as on an operator restart
    pub(crate) fn start_with<F>(seed: F) -> Self
    where
        F: FnOnce(&FakeCluster),
    {
        let (cluster, job_stream, pod_stream) = FakeCluster::new();
        seed(&cluster);
        let shutdown = CancellationToken::new();

        let mut job_dispatcher = Dispatcher::<Job>::new("Job");
        let mut pod_dispatcher = Dispatcher::<Pod>::new("Pod");
        let jobs = job_dispatcher.store();
        let pods = pod_dispatcher.store();

        let engine = Arc::new(Coordinator::new(Duration::from_secs(5), shutdown.clone()));
        let coordinator = Arc::new(JobCoordinator::new(
            jobs.clone(),
            cluster.clone(),
            Arc::clone(&engine),
        ));
        let controller = JobController::new(pods.clone(), cluster.clone(), coordinator.clone());
        let (conductor, handle) = JobConductor::new(
            jobs.clone(),
            pods.clone(),
            coordinator,
            Duration::from_millis(20),
        );

        job_dispatcher.add_listener(engine);
        job_dispatcher.add_listener(Arc::new(controller));
        job_dispatcher.add_listener(Arc::new(handle.clone()));
        pod_dispatcher.add_listener(Arc::new(PodController));
        pod_dispatcher.add_listener(Arc::new(handle));

        let tasks = vec![
            pod_dispatcher.spawn_stream(pod_stream),
            job_dispatcher.spawn_stream(job_stream),
            conductor.spawn(),
        ];

        Self {
            cluster,
            jobs,
            pods,
            shutdown,
            tasks,
        }
    }

    pub(crate) fn state_of(&self, job: &str) -> Option<JobState> {
        self.jobs.get(job).map(|j| j.spec.state)
    }

    pub(crate) fn pods_of(&self, job: &str) -> usize {
        self.pods.count_with_label(cadence_common::JOB_LABEL_KEY, job)
    }

    /// Poll until `job` is READY with exactly `pods` Pods
    pub(crate) async fn converged(&self, job: &str, pods: usize) -> bool {
        for _ in 0..500 {
            if self.state_of(job) == Some(JobState::Ready) && self.pods_of(job) == pods {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Give in-flight events time to drain
    pub(crate) async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pub(crate) async fn stop(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.iter_mut().rev() {
            task.close().await.unwrap();
        }
    }
}

mod scenarios {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_job_with_no_pods_becomes_ready_on_a_threaded_runtime() {
        // nothing but the handshake's own change can trigger READY here
        for _ in 0..25 {
            let harness = Harness::start();

            harness.cluster.create_job("j1", 0);

            assert!(harness.converged("j1", 0).await, "stuck in {:?}", harness.state_of("j1"));
            harness.stop().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_threaded_runtime_provisions_and_scales() {
        let harness = Harness::start();

        harness.cluster.create_job("j1", 3);
        assert!(harness.converged("j1", 3).await);

        harness.cluster.scale_job("j1", 1);
        assert!(harness.converged("j1", 1).await);
        harness.settle().await;
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 3);
        assert_eq!(harness.cluster.deletes.load(Ordering::SeqCst), 2);
        harness.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_restart_leaves_a_converged_job_alone() {
        let harness = Harness::start_with(|cluster| cluster.seed_ready_job("j1", 2).unwrap());

        harness.settle().await;

        assert!(harness.converged("j1", 2).await);
        assert_eq!(harness.cluster.patches.load(Ordering::SeqCst), 0);
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 0);
        assert_eq!(harness.cluster.deletes.load(Ordering::SeqCst), 0);
        harness.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_restarted_job_still_follows_a_scale_change() {
        let harness = Harness::start_with(|cluster| cluster.seed_ready_job("j1", 2).unwrap());
        harness.settle().await;

        harness.cluster.scale_job("j1", 3);

        assert!(harness.converged("j1", 3).await);
        harness.settle().await;
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn story_new_job_gets_its_pods_and_becomes_ready() {
        let harness = Harness::start();

        harness.cluster.create_job("j1", 3);

        assert!(harness.converged("j1", 3).await);
        harness.settle().await;
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 3);
        assert_eq!(harness.cluster.deletes.load(Ordering::SeqCst), 0);
        assert_eq!(harness.state_of("j1"), Some(JobState::Ready));
        harness.stop().await;
    }

    #[tokio::test]
    async fn story_scale_down_deletes_excess_and_returns_to_ready() {
        let harness = Harness::start();
        harness.cluster.create_job("j1", 3);
        assert!(harness.converged("j1", 3).await);

        harness.cluster.scale_job("j1", 1);

        assert!(harness.converged("j1", 1).await);
        harness.settle().await;
        assert_eq!(harness.cluster.deletes.load(Ordering::SeqCst), 2);
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 3);
        assert_eq!(harness.pods_of("j1"), 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn story_scale_up_adds_pods() {
        let harness = Harness::start();
        harness.cluster.create_job("j1", 1);
        assert!(harness.converged("j1", 1).await);

        harness.cluster.scale_job("j1", 4);

        assert!(harness.converged("j1", 4).await);
        harness.settle().await;
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 4);
        harness.stop().await;
    }

    #[tokio::test]
    async fn story_evicted_pod_is_replaced() {
        let harness = Harness::start();
        harness.cluster.create_job("j1", 2);
        assert!(harness.converged("j1", 2).await);

        let victim = harness.cluster.any_pod_of("j1").unwrap();
        assert!(harness.cluster.evict_pod(&victim));

        harness.settle().await;
        assert!(harness.converged("j1", 2).await);
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 3);
        assert!(!harness.pods.contains(&victim));
        harness.stop().await;
    }

    #[tokio::test]
    async fn story_job_with_no_pods_still_becomes_ready() {
        let harness = Harness::start();

        harness.cluster.create_job("j1", 0);

        assert!(harness.converged("j1", 0).await);
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn story_independent_jobs_converge_independently() {
        let harness = Harness::start();

        harness.cluster.create_job("j1", 2);
        harness.cluster.create_job("j2", 3);

        assert!(harness.converged("j1", 2).await);
        assert!(harness.converged("j2", 3).await);
        assert_eq!(harness.pods.len(), 5);
        harness.stop().await;
    }

    #[tokio::test]
    async fn story_deleted_job_stops_reconciling() {
        let harness = Harness::start();
        harness.cluster.create_job("j1", 2);
        assert!(harness.converged("j1", 2).await);
        harness.settle().await;
        let patches = harness.cluster.patches.load(Ordering::SeqCst);

        harness.cluster.delete_job("j1");
        harness.settle().await;

        assert!(harness.jobs.is_empty());
        assert!(harness.pods.is_empty());
        assert_eq!(harness.cluster.patches.load(Ordering::SeqCst), patches);
        assert_eq!(harness.cluster.creates.load(Ordering::SeqCst), 2);
        harness.stop().await;
    }
}
