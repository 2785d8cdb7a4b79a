use crate::{pipeline::Outcome, wait};
use mesh_provisioner_core::{CertManagerConfig, Platform, ResourceRef, Result, RunConfig, Tool};
use mesh_provisioner_k8s_api::{cert_manager, readiness};
use tracing::info;

const CHART_REPO_NAME: &str = "jetstack";
const CHART_REPO_URL: &str = "https://charts.jetstack.io";

pub(crate) async fn install(config: &RunConfig, platform: &Platform) -> Result<Outcome> {
    let cm = &config.cert_manager;
    let cluster = &*platform.cluster;

    let controller = ResourceRef::deployment(&cm.namespace, CertManagerConfig::DEPLOYMENTS[0]);
    let outcome = if cluster.exists(&controller).await? {
        info!(namespace = %cm.namespace, "cert-manager already installed");
        Outcome::AlreadyPresent
    } else {
        info!(version = %cm.chart_version, namespace = %cm.namespace, "installing cert-manager");
        for args in helm_commands(cm) {
            platform.tools.run(Tool::Helm, &args).await?;
        }
        Outcome::Created
    };

    wait::deployments(
        cluster,
        &cm.namespace,
        CertManagerConfig::DEPLOYMENTS,
        config.timeouts.resource,
    )
    .await?;
    Ok(outcome)
}

fn helm_commands(cm: &CertManagerConfig) -> Vec<Vec<String>> {
    let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    let chart = format!("{CHART_REPO_NAME}/cert-manager");
    vec![
        owned(&["repo", "add", CHART_REPO_NAME, CHART_REPO_URL, "--force-update"]),
        owned(&["repo", "update"]),
        owned(&[
            "install",
            "cert-manager",
            chart.as_str(),
            "--namespace",
            cm.namespace.as_str(),
            "--create-namespace",
            "--version",
            cm.chart_version.as_str(),
            "--set",
            "crds.enabled=true",
        ]),
    ]
}

/// Creates the ACME cluster issuer for the configured mode and waits until it has registered.
pub(crate) async fn issuer(config: &RunConfig, platform: &Platform, fqdn: &str) -> Result<Outcome> {
    let cluster = &*platform.cluster;
    let issuer = cert_manager::issuer_ref(config);

    let outcome = if cluster.exists(&issuer).await? {
        info!(%issuer, "already exists");
        Outcome::AlreadyPresent
    } else {
        info!(%issuer, server = %config.cert_manager.issuer_mode.acme_server(), "creating");
        let manifest = cert_manager::issuer_manifest(config, fqdn)?;
        cluster.apply(&manifest.to_yaml()?, None).await?;
        Outcome::Created
    };

    wait::condition(
        cluster,
        &issuer,
        readiness::CONDITION_READY,
        config.timeouts.resource,
    )
    .await?;
    Ok(outcome)
}

/// Requests the ingress certificate and waits for cert-manager to store it.
pub(crate) async fn certificate(
    config: &RunConfig,
    platform: &Platform,
    fqdn: &str,
) -> Result<Outcome> {
    let cluster = &*platform.cluster;
    let certificate = cert_manager::certificate_ref(config);

    let outcome = if cluster.exists(&certificate).await? {
        info!(%certificate, "already exists");
        Outcome::AlreadyPresent
    } else {
        info!(%certificate, %fqdn, issuer = %config.issuer_name(), "requesting");
        let manifest = cert_manager::certificate_manifest(config, fqdn)?;
        cluster.apply(&manifest.to_yaml()?, None).await?;
        Outcome::Created
    };

    wait::exists(
        cluster,
        &cert_manager::certificate_secret_ref(config),
        config.timeouts.certificate,
    )
    .await?;
    Ok(outcome)
}
