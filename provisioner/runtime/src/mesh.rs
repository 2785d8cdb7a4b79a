use crate::{pipeline::Outcome, wait};
use mesh_provisioner_core::{
    cloud::find_public_ip, poll, Error, Platform, ResourceRef, Result, RunConfig, Tool,
};
use mesh_provisioner_k8s_api::{authz, readiness};
use std::net::IpAddr;
use tracing::info;

/// The public entry point of the mesh ingress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: IpAddr,
    pub fqdn: String,
}

/// Installs the Gateway API CRDs and the mesh control plane with its ingress gateway.
pub(crate) async fn install(config: &RunConfig, platform: &Platform) -> Result<Outcome> {
    let mesh = &config.mesh;
    let cluster = &*platform.cluster;

    let outcome = if cluster.exists(&ResourceRef::namespace(&mesh.namespace)).await?
        && cluster
            .exists(&ResourceRef::deployment(&mesh.namespace, &mesh.ingress))
            .await?
    {
        info!(namespace = %mesh.namespace, "mesh already installed");
        Outcome::AlreadyPresent
    } else {
        info!(version = %mesh.gateway_api_version, "applying Gateway API CRDs");
        cluster
            .apply_url(&config.gateway_api_bundle_url(), None)
            .await?;

        info!(version = %mesh.version, profile = %mesh.profile, "installing mesh");
        platform
            .tools
            .run(Tool::Istioctl, &install_args(config))
            .await?;
        Outcome::Created
    };

    wait::deployments(
        cluster,
        &mesh.namespace,
        [mesh.control_plane.as_str(), mesh.ingress.as_str()],
        config.timeouts.resource,
    )
    .await?;
    if outcome == Outcome::Created {
        poll::settle("load balancer", config.timeouts.load_balancer_settle).await;
    }
    Ok(outcome)
}

fn install_args(config: &RunConfig) -> Vec<String> {
    let mut settings = vec![
        format!("profile={}", config.mesh.profile),
        "meshConfig.accessLogFile=/dev/stdout".to_string(),
    ];
    if let Some(authz) = &config.authz {
        settings.extend(authz::mesh_settings(authz));
    }

    let mut args = vec!["install".to_string()];
    for setting in settings {
        args.push("--set".to_string());
        args.push(setting);
    }
    args.push("-y".to_string());
    args
}

/// Resolves the ingress address and gives its public IP a DNS label derived from the run id.
pub(crate) async fn resolve_endpoint(
    config: &RunConfig,
    platform: &Platform,
) -> Result<(Outcome, Endpoint)> {
    let mesh = &config.mesh;
    let cluster = &*platform.cluster;
    let service = &ResourceRef::service(&mesh.namespace, &mesh.ingress);

    info!(%service, "waiting for external address");
    let address = poll::await_value(
        format!("external address of {service}"),
        config.timeouts.address,
        || async move {
            Ok(cluster
                .get(service)
                .await?
                .and_then(|svc| readiness::load_balancer_ip(&svc)))
        },
    )
    .await?;
    info!(%address, "ingress address assigned");

    let cloud = &platform.cloud;
    let node_rg = cloud
        .node_resource_group(&config.resource_group, &config.cluster_name)
        .await?;
    let ips = cloud.public_ips(&node_rg).await?;
    let ip = find_public_ip(&ips, address).ok_or_else(|| Error::AddressNotFound {
        address,
        resource_group: node_rg.clone(),
    })?;

    let label = config.run_id.dns_label();
    if let (Some(current), Some(fqdn)) = (&ip.dns_label, &ip.fqdn) {
        if *current == label {
            info!(ip = %ip.name, %fqdn, "DNS label already assigned");
            let endpoint = Endpoint {
                address,
                fqdn: fqdn.clone(),
            };
            return Ok((Outcome::AlreadyPresent, endpoint));
        }
    }

    info!(ip = %ip.name, %label, "assigning DNS label");
    let fqdn = cloud.assign_dns_label(&node_rg, &ip.name, &label).await?;
    info!(%fqdn, "DNS label assigned");
    Ok((Outcome::Created, Endpoint { address, fqdn }))
}
