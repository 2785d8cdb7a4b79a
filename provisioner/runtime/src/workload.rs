use crate::{pipeline::Outcome, wait};
use mesh_provisioner_core::{poll, Platform, ResourceRef, Result, RunConfig};
use mesh_provisioner_k8s_api::workload_namespace;
use tracing::info;

/// Deploys the sample application into a mesh-injected namespace.
///
/// Readiness is checked on every run, so a run that timed out waiting for a deployment is
/// resumed by running again.
pub(crate) async fn deploy(config: &RunConfig, platform: &Platform) -> Result<Outcome> {
    let workload = &config.workload;
    let cluster = &*platform.cluster;

    let mut present = true;
    for name in &workload.deployments {
        if !cluster
            .exists(&ResourceRef::deployment(&workload.namespace, name))
            .await?
        {
            present = false;
            break;
        }
    }

    let outcome = if present {
        info!(namespace = %workload.namespace, "sample application already deployed");
        Outcome::AlreadyPresent
    } else {
        cluster
            .apply(&workload_namespace(config)?.to_yaml()?, None)
            .await?;
        info!(namespace = %workload.namespace, "deploying sample application");
        cluster
            .apply_url(&config.workload_manifest_url(), Some(&workload.namespace))
            .await?;
        Outcome::Created
    };

    wait::deployments(
        cluster,
        &workload.namespace,
        workload.deployments.iter().map(String::as_str),
        config.timeouts.resource,
    )
    .await?;
    if outcome == Outcome::Created {
        poll::settle("sample application", config.timeouts.workload_settle).await;
    }
    Ok(outcome)
}
