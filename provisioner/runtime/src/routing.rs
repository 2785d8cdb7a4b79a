use crate::pipeline::Outcome;
use mesh_provisioner_core::{Platform, Result, RunConfig};
use mesh_provisioner_k8s_api::gateway;
use tracing::info;

/// Exposes the sample application through the mesh ingress over HTTP and HTTPS.
///
/// The Gateway, HTTPRoute and ReferenceGrant are skipped only when all of them exist.
pub(crate) async fn configure(
    config: &RunConfig,
    platform: &Platform,
    fqdn: &str,
) -> Result<Outcome> {
    let cluster = &platform.cluster;
    let manifest = gateway::routing_manifest(config, fqdn)?;

    let mut missing = Vec::new();
    for resource in manifest.resources() {
        if !cluster.exists(&resource).await? {
            missing.push(resource);
        }
    }
    if missing.is_empty() {
        info!(namespace = %config.mesh.namespace, "routing already configured");
        return Ok(Outcome::AlreadyPresent);
    }

    for resource in &missing {
        info!(%resource, "missing");
    }
    let applied = cluster.apply(&manifest.to_yaml()?, None).await?;
    for resource in &applied {
        info!(%resource, "applied");
    }
    Ok(Outcome::Created)
}
