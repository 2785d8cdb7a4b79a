use crate::{pipeline::Outcome, wait};
use mesh_provisioner_core::{
    AuthzConfig, Cluster, Platform, ResourceRef, Result, RunConfig, Tool,
};
use mesh_provisioner_k8s_api::{
    authz::{self, AUTHORIZED_HEADER, AUTHZ_LABEL, CLIENT_CONTAINER, CLIENT_POD},
    readiness,
};
use tracing::{info, warn};

const DECISION_LOG_LINES: &str = "--tail=10";

/// A request sent from inside the mesh and the decision OPA should have made about it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthzCheck {
    pub url: String,
    /// Whether the request carried the authorization header.
    pub authorized: bool,
    pub expect_allowed: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

// === impl AuthzCheck ===

impl AuthzCheck {
    fn new(url: String, authorized: bool, expect_allowed: bool) -> Self {
        Self {
            url,
            authorized,
            expect_allowed,
            status: None,
            error: None,
        }
    }

    /// True when the response matches the expected decision. Denials are `403`.
    pub fn passed(&self) -> bool {
        match self.status {
            Some(status) if self.expect_allowed => (200..400).contains(&status),
            Some(status) => status == 403,
            None => false,
        }
    }
}

/// Deploys the OPA external authorization server.
pub(crate) async fn deploy(config: &RunConfig, platform: &Platform) -> Result<Outcome> {
    let Some(opa) = &config.authz else {
        return Ok(Outcome::Disabled);
    };
    let cluster = &*platform.cluster;
    let server = authz::deployment_ref(opa);

    let outcome = if cluster.exists(&ResourceRef::namespace(&opa.namespace)).await?
        && cluster.exists(&server).await?
    {
        info!(namespace = %opa.namespace, "authorization server already deployed");
        Outcome::AlreadyPresent
    } else {
        info!(namespace = %opa.namespace, image = %opa.image, "deploying authorization server");
        cluster
            .apply(&authz::server_manifest(opa)?.to_yaml()?, None)
            .await?;
        Outcome::Created
    };

    // An edited policy is never replaced.
    let policy = authz::policy_config_map_ref(opa);
    if !cluster.exists(&policy).await? {
        info!(%policy, "seeding policy");
        cluster
            .apply(&authz::policy_manifest(opa)?.to_yaml()?, None)
            .await?;
    }

    wait::deployment(cluster, &opa.namespace, &server.name, config.timeouts.resource).await?;
    Ok(outcome)
}

/// Routes the front end's requests through OPA.
pub(crate) async fn bind(config: &RunConfig, platform: &Platform) -> Result<Outcome> {
    let Some(opa) = &config.authz else {
        return Ok(Outcome::Disabled);
    };
    let cluster = &*platform.cluster;
    let mut outcome = Outcome::AlreadyPresent;

    let policy = authz::authorization_policy_ref(config);
    if !cluster.exists(&policy).await? {
        info!(%policy, provider = %opa.provider, "applying");
        let manifest = authz::authorization_manifest(config, opa)?;
        cluster.apply(&manifest.to_yaml()?, None).await?;
        outcome = Outcome::Created;
    }

    let frontend = ResourceRef::deployment(
        &config.workload.namespace,
        config.workload.frontend_deployment(),
    );
    if enable(cluster, &frontend).await? {
        outcome = Outcome::Created;
    }
    Ok(outcome)
}

/// Labels a deployment's pod template for external authorization. Returns false if the
/// label was already set.
async fn enable(cluster: &dyn Cluster, deployment: &ResourceRef) -> Result<bool> {
    let labeled = cluster
        .get(deployment)
        .await?
        .and_then(|d| d.pointer("/spec/template").cloned())
        .is_some_and(|template| readiness::has_label(&template, AUTHZ_LABEL, "enabled"));
    if labeled {
        return Ok(false);
    }
    info!(%deployment, "enabling external authorization");
    cluster
        .merge_patch(deployment, &authz::enable_authz_patch())
        .await?;
    Ok(true)
}

/// Sends requests from a client pod inside the mesh and checks that OPA allows and denies
/// them as the seeded policy says. Never fails the run.
pub(crate) async fn verify(config: &RunConfig, platform: &Platform) -> Option<Vec<AuthzCheck>> {
    let opa = config.authz.as_ref()?;
    let checks = match run_checks(config, opa, platform).await {
        Ok(checks) => checks,
        Err(error) => {
            warn!(%error, "unable to verify external authorization");
            return Some(Vec::new());
        }
    };

    for check in &checks {
        let decision = if check.expect_allowed { "allow" } else { "deny" };
        if check.passed() {
            info!(
                url = %check.url,
                authorized = check.authorized,
                status = ?check.status,
                %decision,
                "authorization check"
            );
        } else {
            warn!(
                url = %check.url,
                authorized = check.authorized,
                status = ?check.status,
                error = check.error.as_deref().unwrap_or(""),
                expected = %decision,
                "authorization check failed"
            );
        }
    }

    let server = format!("deployment/{}", authz::deployment_ref(opa).name);
    let logs = platform
        .tools
        .run(
            Tool::Kubectl,
            &owned(&[
                "logs",
                "-n",
                opa.namespace.as_str(),
                server.as_str(),
                DECISION_LOG_LINES,
            ]),
        )
        .await;
    match logs {
        Ok(logs) => {
            for line in logs.lines().filter(|l| !l.trim().is_empty()) {
                info!(decision = %line, "opa");
            }
        }
        Err(error) => warn!(%error, "unable to read decision logs"),
    }
    Some(checks)
}

async fn run_checks(
    config: &RunConfig,
    opa: &AuthzConfig,
    platform: &Platform,
) -> Result<Vec<AuthzCheck>> {
    let workload = &config.workload;
    let cluster = &*platform.cluster;
    let ns = workload.namespace.as_str();

    let client = authz::client_pod_ref(ns);
    if !cluster.exists(&client).await? {
        info!(pod = %client, "starting test client");
        cluster
            .apply(&authz::client_manifest(ns)?.to_yaml()?, None)
            .await?;
    }
    wait::condition(
        cluster,
        &client,
        readiness::CONDITION_READY,
        config.timeouts.resource,
    )
    .await?;

    let protected = ResourceRef::deployment(ns, workload.protected_deployment());
    if enable(cluster, &protected).await? {
        let deployment = format!("deployment/{}", protected.name);
        let timeout = format!("--timeout={}s", config.timeouts.resource.budget().as_secs());
        let args = owned(&["rollout", "status", "-n", ns, deployment.as_str(), timeout.as_str()]);
        platform.tools.run(Tool::Kubectl, &args).await?;
    }

    let protected_url = workload.service_url(&workload.protected, "/reviews/1");
    let mut checks = vec![
        AuthzCheck::new(
            workload.service_url(&workload.frontend, "/productpage"),
            false,
            true,
        ),
        AuthzCheck::new(protected_url.clone(), false, false),
        AuthzCheck::new(protected_url, true, true),
    ];
    info!(provider = %opa.provider, client = %CLIENT_POD, "checking authorization decisions");
    for check in &mut checks {
        let args = curl_args(ns, &check.url, check.authorized);
        match platform.tools.run(Tool::Kubectl, &args).await {
            Ok(out) => match out.trim().parse::<u16>() {
                Ok(status) => check.status = Some(status),
                Err(_) => check.error = Some(format!("unexpected response: {}", out.trim())),
            },
            Err(error) => check.error = Some(error.to_string()),
        }
    }
    Ok(checks)
}

fn curl_args(namespace: &str, url: &str, authorized: bool) -> Vec<String> {
    let mut args = owned(&[
        "exec",
        "-n",
        namespace,
        CLIENT_POD,
        "-c",
        CLIENT_CONTAINER,
        "--",
        "curl",
        "-s",
        "-o",
        "/dev/null",
        "-w",
        "%{http_code}",
        "--max-time",
        "10",
    ]);
    if authorized {
        args.push("-H".to_string());
        args.push(AUTHORIZED_HEADER.to_string());
    }
    args.push(url.to_string());
    args
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}
