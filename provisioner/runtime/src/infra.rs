use crate::pipeline::Outcome;
use mesh_provisioner_core::{poll, Account, ClusterSpec, Platform, Result, RunConfig};
use mesh_provisioner_k8s_api::readiness;
use std::collections::BTreeMap;
use tracing::info;

const PROVISIONING_SUCCEEDED: &str = "Succeeded";

/// Tags recorded on every resource a run creates.
fn tags() -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("CREATED_BY".to_string(), "mesh-provisioner".to_string());
    tags.insert(
        "CREATED_DATE".to_string(),
        chrono::Utc::now().format("%Y-%m-%d").to_string(),
    );
    tags
}

pub(crate) async fn resource_group(
    config: &RunConfig,
    platform: &Platform,
    account: &Account,
) -> Result<Outcome> {
    let cloud = &platform.cloud;
    if cloud.resource_group_exists(&config.resource_group).await? {
        info!(resource_group = %config.resource_group, "already exists");
        return Ok(Outcome::AlreadyPresent);
    }

    info!(
        resource_group = %config.resource_group,
        location = %config.location,
        subscription = %account.subscription_name,
        "creating"
    );
    cloud
        .create_resource_group(&config.resource_group, &config.location, &tags())
        .await?;
    Ok(Outcome::Created)
}

/// Ensures the managed cluster exists, points the local kubeconfig at it, and waits until it
/// has a schedulable node.
pub(crate) async fn cluster(
    config: &RunConfig,
    platform: &Platform,
    account: &Account,
) -> Result<Outcome> {
    let cloud = &platform.cloud;
    let rg = config.resource_group.as_str();
    let name = config.cluster_name.as_str();

    let outcome = if cloud.cluster_exists(rg, name).await? {
        info!(cluster = %name, "already exists");
        Outcome::AlreadyPresent
    } else {
        info!(
            cluster = %name,
            subscription = %account.subscription_name,
            "creating; this takes several minutes"
        );
        cloud
            .create_cluster(&ClusterSpec {
                resource_group: config.resource_group.clone(),
                name: config.cluster_name.clone(),
                kubernetes_version: config.kubernetes_version.clone(),
                node_count: config.node_count,
                node_vm_size: config.node_vm_size.clone(),
                tags: tags(),
            })
            .await?;
        Outcome::Created
    };

    cloud.fetch_credentials(rg, name).await?;

    let what = format!("cluster {name}");
    poll::await_ready(&what, config.timeouts.cluster, || async move {
        let state = cloud.cluster_provisioning_state(rg, name).await?;
        if state != PROVISIONING_SUCCEEDED {
            info!(cluster = %name, %state, "provisioning");
            return Ok(false);
        }
        let nodes = platform.cluster.list("v1", "Node", None).await?;
        Ok(nodes.iter().any(readiness::node_ready))
    })
    .await?;
    info!(cluster = %name, "ready");

    if outcome == Outcome::Created {
        poll::settle("cluster", config.timeouts.cluster_settle).await;
    }
    Ok(outcome)
}
