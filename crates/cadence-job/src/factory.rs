//! Mutations issued against the cluster
//!
//! The traits are the seam between the reconciliation engine and the API
//! server; the `Kube*` types are the production implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use cadence_common::crd::{Job, JobState};
use cadence_common::{Store, APP_LABEL_KEY, APP_LABEL_VALUE, FIELD_MANAGER, JOB_LABEL_KEY};

use crate::JobError;

/// Length of the random suffix appended to generated Pod names
pub const POD_SUFFIX_LEN: usize = 5;

/// Name of the single container in every worker Pod
pub const CONTAINER_NAME: &str = "main";

/// Writes a Job's `spec.state`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobFactory: Send + Sync {
    async fn update_state(&self, job: &Job, state: JobState) -> Result<(), JobError>;
}

/// Creates and deletes worker Pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodFactory: Send + Sync {
    /// Create one Pod for `job`, returning its name
    async fn create(&self, job: &Job) -> Result<String, JobError>;

    async fn delete(&self, pod: &Pod) -> Result<(), JobError>;
}

fn namespace_of<K: ResourceExt>(kind: &'static str, resource: &K) -> Result<String, JobError> {
    resource
        .namespace()
        .ok_or_else(|| JobError::missing(kind, resource.name_any(), "metadata.namespace"))
}

/// Merge-patches `spec.state` through the API server
pub struct KubeJobFactory {
    client: Client,
}

impl KubeJobFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobFactory for KubeJobFactory {
    async fn update_state(&self, job: &Job, state: JobState) -> Result<(), JobError> {
        let name = job.name_any();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace_of("Job", job)?);
        let patch = serde_json::json!({ "spec": { "state": state } });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        debug!(job = %name, %state, "UPD - {}", name);
        api.patch(&name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

/// Creates Pods from a Job's image and arguments
pub struct KubePodFactory {
    client: Client,
    pods: Store<Pod>,
}

impl KubePodFactory {
    /// `pods` is consulted so generated names do not collide with known Pods
    pub fn new(client: Client, pods: Store<Pod>) -> Self {
        Self { client, pods }
    }
}

#[async_trait]
impl PodFactory for KubePodFactory {
    async fn create(&self, job: &Job) -> Result<String, JobError> {
        let name = unique_pod_name(
            &job.name_any(),
            |candidate| self.pods.contains(candidate),
            random_suffix,
        );
        let pod = build_pod(job, &name)?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace_of("Job", job)?);

        api.create(&PostParams::default(), &pod).await?;
        debug!(job = %job.name_any(), pod = %name, "created pod");
        Ok(name)
    }

    async fn delete(&self, pod: &Pod) -> Result<(), JobError> {
        let name = pod.name_any();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace_of("Pod", pod)?);

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(pod = %name, "deleted pod");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %name, "pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(POD_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// `<job>-<suffix>`, drawing suffixes until `taken` rejects none
pub fn unique_pod_name<T, S>(job_name: &str, taken: T, mut suffix: S) -> String
where
    T: Fn(&str) -> bool,
    S: FnMut() -> String,
{
    loop {
        let candidate = format!("{}-{}", job_name, suffix());
        if !taken(&candidate) {
            return candidate;
        }
    }
}

/// Pod manifest for one worker of `job`
///
/// The Pod runs `spec.image` with `spec.args` as its command, never restarts,
/// carries the correlation labels, and is owned by the Job so garbage
/// collection removes it with the Job.
pub fn build_pod(job: &Job, name: &str) -> Result<Pod, JobError> {
    let job_name = job.name_any();
    let namespace = namespace_of("Job", job)?;
    let mut owner = job
        .controller_owner_ref(&())
        .ok_or_else(|| JobError::missing("Job", job_name.clone(), "metadata.uid"))?;
    owner.block_owner_deletion = Some(true);

    let labels = BTreeMap::from([
        (APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string()),
        (JOB_LABEL_KEY.to_string(), job_name),
    ]);

    let command = (!job.spec.args.is_empty()).then(|| job.spec.args.clone());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(job.spec.image.clone()),
                command,
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}
