//! Stories about a Job's life under the operator

use std::time::Duration;

use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};

use cadence_common::config::OperatorConfig;
use cadence_common::crd::{Job, JobSpec};
use cadence_operator::startup::ensure_crds_installed;
use cadence_operator::Operator;

use super::helpers::{client, is_converged, observe, unique_name, wait_until, NAMESPACE};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(120);

fn sample_job(name: &str, desired: u32) -> Job {
    Job::new(
        name,
        JobSpec::new("busybox:1.36", desired).with_args(["sleep", "3600"]),
    )
}

async fn started_operator(client: &kube::Client) -> Operator {
    ensure_crds_installed(client).await.unwrap();
    let config = OperatorConfig {
        namespace: NAMESPACE.to_string(),
        sweep: Duration::from_secs(1),
        ..Default::default()
    };
    let mut operator = Operator::new(client.clone(), &config);
    operator.start().unwrap();
    operator
}

/// Story: a platform user declares a Job with three workers and the operator
/// brings up exactly three Pods before marking it READY. Scaling it to one
/// removes two Pods and it settles back at READY. Deleting the Job lets
/// garbage collection take the remaining Pod.
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_job_converges_through_scale_down_and_delete() {
    let client = client().await;
    let mut operator = started_operator(&client).await;
    let jobs: Api<Job> = Api::namespaced(client.clone(), NAMESPACE);
    let name = unique_name("story");

    jobs.create(&PostParams::default(), &sample_job(&name, 3))
        .await
        .unwrap();
    assert!(
        wait_until(CONVERGE_TIMEOUT, || is_converged(&client, &name, 3)).await,
        "job never reached READY with 3 pods: {:?}",
        observe(&client, &name).await
    );

    let scale = serde_json::json!({ "spec": { "desired": 1 } });
    jobs.patch(&name, &PatchParams::default(), &Patch::Merge(&scale))
        .await
        .unwrap();
    assert!(
        wait_until(CONVERGE_TIMEOUT, || is_converged(&client, &name, 1)).await,
        "job never settled at 1 pod: {:?}",
        observe(&client, &name).await
    );

    jobs.delete(&name, &DeleteParams::default()).await.unwrap();
    assert!(
        wait_until(CONVERGE_TIMEOUT, || async {
            observe(&client, &name).await == (None, 0)
        })
        .await
    );

    operator.close().await;
    operator.close().await;
}

/// Story: a worker Pod is deleted out from under a READY Job and the
/// operator replaces it.
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_lost_pod_is_replaced() {
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ListParams;

    let client = client().await;
    let mut operator = started_operator(&client).await;
    let jobs: Api<Job> = Api::namespaced(client.clone(), NAMESPACE);
    let pods: Api<Pod> = Api::namespaced(client.clone(), NAMESPACE);
    let name = unique_name("evict");

    let job = jobs
        .create(&PostParams::default(), &sample_job(&name, 2))
        .await
        .unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || is_converged(&client, &name, 2)).await);

    let listed = pods
        .list(&ListParams::default().labels(&job.pod_selector()))
        .await
        .unwrap();
    let victim = listed.items[0].metadata.name.clone().unwrap();
    pods.delete(&victim, &DeleteParams::default()).await.unwrap();

    assert!(wait_until(CONVERGE_TIMEOUT, || is_converged(&client, &name, 2)).await);

    jobs.delete(&name, &DeleteParams::default()).await.unwrap();
    operator.close().await;
}
