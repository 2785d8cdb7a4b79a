use mesh_provisioner_core::{poll, Cluster, ResourceRef, Result, Schedule};
use mesh_provisioner_k8s_api::readiness;
use tracing::info;

pub(crate) async fn deployment(
    cluster: &dyn Cluster,
    namespace: &str,
    name: &str,
    schedule: Schedule,
) -> Result<()> {
    let resource = &ResourceRef::deployment(namespace, name);
    info!(%namespace, deployment = %name, "waiting for deployment");
    poll::await_ready(resource, schedule, || async move {
        Ok(cluster
            .get(resource)
            .await?
            .is_some_and(|d| readiness::deployment_ready(&d)))
    })
    .await?;
    info!(%namespace, deployment = %name, "ready");
    Ok(())
}

/// Waits for each deployment in turn; all of them must become ready.
pub(crate) async fn deployments<'a>(
    cluster: &dyn Cluster,
    namespace: &str,
    names: impl IntoIterator<Item = &'a str>,
    schedule: Schedule,
) -> Result<()> {
    for name in names {
        deployment(cluster, namespace, name, schedule).await?;
    }
    Ok(())
}

pub(crate) async fn exists(
    cluster: &dyn Cluster,
    resource: &ResourceRef,
    schedule: Schedule,
) -> Result<()> {
    info!(%resource, "waiting for resource");
    poll::await_ready(resource, schedule, || cluster.exists(resource)).await?;
    Ok(())
}

pub(crate) async fn condition(
    cluster: &dyn Cluster,
    resource: &ResourceRef,
    condition: &str,
    schedule: Schedule,
) -> Result<()> {
    info!(%resource, %condition, "waiting for condition");
    poll::await_ready(resource, schedule, || async move {
        Ok(cluster
            .get(resource)
            .await?
            .is_some_and(|obj| readiness::has_condition(&obj, condition)))
    })
    .await?;
    Ok(())
}
