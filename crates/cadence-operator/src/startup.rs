//! Startup tasks that must complete before any watch begins

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, CustomResourceExt};
use tracing::info;

use cadence_common::crd::Job;
use cadence_common::{FIELD_MANAGER, JOB_CRD_NAME};

/// How long to wait for the API server to start serving the Job CRD
pub const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Install or update the Job CRD and wait until it is established
///
/// Server-side apply keeps the installed schema in step with the operator
/// version on every restart.
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing {} CRD...", JOB_CRD_NAME);
    crds.patch(JOB_CRD_NAME, &params, &Patch::Apply(&Job::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", JOB_CRD_NAME, e))?;

    let established = await_condition(crds, JOB_CRD_NAME, conditions::is_crd_established());
    tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, established)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {} to be established", JOB_CRD_NAME))?
        .map_err(|e| anyhow::anyhow!("failed waiting for {}: {}", JOB_CRD_NAME, e))?;

    info!("{} CRD established", JOB_CRD_NAME);
    Ok(())
}

/// The Job CRD as YAML, for `cadence --crd`
pub fn crd_manifest() -> anyhow::Result<String> {
    serde_yaml::to_string(&Job::crd()).map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}
