use crate::{
    authz::{self, AuthzCheck},
    certs, infra,
    mesh::{self, Endpoint},
    policy::{self, AddonHealth},
    prereq, routing,
    smoke::{self, SmokeResult},
    workload,
};
use mesh_provisioner_core::{Account, Platform, Result, RunConfig};
use mesh_provisioner_k8s_api::gatekeeper::ConstraintReport;
use std::{fmt, future::Future};
use tokio::time;
use tracing::{error, info, info_span, warn, Instrument};

/// Steps of a run, in execution order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Prerequisites,
    ResourceGroup,
    Cluster,
    Mesh,
    Authz,
    Dns,
    CertManager,
    Issuer,
    Certificate,
    PolicyAddon,
    Policy,
    Gateway,
    Workload,
    AuthzBinding,
    AuthzCheck,
    Compliance,
    SmokeTest,
}

/// What a step did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    AlreadyPresent,
    Verified,
    Disabled,
}

#[derive(Clone, Debug)]
pub struct Summary {
    pub config: RunConfig,
    pub account: Option<Account>,
    pub endpoint: Option<Endpoint>,
    pub steps: Vec<(Stage, Outcome)>,
    pub policy_addon: Option<AddonHealth>,
    pub authz_checks: Vec<AuthzCheck>,
    pub compliance: Vec<ConstraintReport>,
    pub smoke: Vec<SmokeResult>,
}

// === impl Stage ===

impl Stage {
    /// Stages that create external resources and are skipped when those already exist.
    pub fn is_provisioning(&self) -> bool {
        !matches!(
            self,
            Self::Prerequisites
                | Self::PolicyAddon
                | Self::AuthzCheck
                | Self::Compliance
                | Self::SmokeTest
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prerequisites => "prerequisites",
            Self::ResourceGroup => "resource-group",
            Self::Cluster => "cluster",
            Self::Mesh => "mesh",
            Self::Authz => "authz",
            Self::Dns => "dns",
            Self::CertManager => "cert-manager",
            Self::Issuer => "issuer",
            Self::Certificate => "certificate",
            Self::PolicyAddon => "policy-addon",
            Self::Policy => "policy",
            Self::Gateway => "gateway",
            Self::Workload => "workload",
            Self::AuthzBinding => "authz-binding",
            Self::AuthzCheck => "authz-check",
            Self::Compliance => "compliance",
            Self::SmokeTest => "smoke-test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::AlreadyPresent => "already exists, skipped",
            Self::Verified => "verified",
            Self::Disabled => "disabled",
        })
    }
}

// === impl Summary ===

impl Summary {
    fn new(config: &RunConfig) -> Self {
        Self {
            config: config.clone(),
            account: None,
            endpoint: None,
            steps: Vec::new(),
            policy_addon: None,
            authz_checks: Vec::new(),
            compliance: Vec::new(),
            smoke: Vec::new(),
        }
    }

    pub fn outcome(&self, stage: Stage) -> Option<Outcome> {
        self.steps
            .iter()
            .find_map(|(s, o)| (*s == stage).then_some(*o))
    }

    /// Runs one stage inside its own span and records its outcome.
    async fn stage<T>(
        &mut self,
        stage: Stage,
        step: impl Future<Output = Result<(Outcome, T)>>,
    ) -> Result<T> {
        let span = info_span!("stage", %stage);
        let start = time::Instant::now();
        match step.instrument(span).await {
            Ok((outcome, value)) => {
                info!(%stage, %outcome, elapsed = ?start.elapsed(), "completed");
                self.steps.push((stage, outcome));
                Ok(value)
            }
            Err(error) => {
                error!(%stage, %error, "failed; resources created so far are left in place");
                Err(error)
            }
        }
    }

    fn log(&self) {
        let config = &self.config;
        info!(
            run_id = %config.run_id,
            resource_group = %config.resource_group,
            cluster = %config.cluster_name,
            location = %config.location,
            kubernetes = %config.kubernetes_version,
            istio = %config.mesh.version,
            issuer = %config.cert_manager.issuer_mode,
            "provisioning complete"
        );
        if let Some(account) = &self.account {
            info!(subscription = %account.subscription_name, user = %account.user, "account");
        }
        for (stage, outcome) in &self.steps {
            info!(%stage, %outcome);
        }
        if let Some(Endpoint { address, fqdn }) = &self.endpoint {
            info!(%address, %fqdn, "ingress");
            info!("application: https://{fqdn}/productpage");
        }
        if let Some(health) = &self.policy_addon {
            info!(
                running = health.is_running(),
                policy = health.policy_pods,
                gatekeeper = health.gatekeeper_pods,
                "policy add-on"
            );
        }
        if !self.authz_checks.is_empty() {
            let passed = self.authz_checks.iter().filter(|c| c.passed()).count();
            info!(passed, total = self.authz_checks.len(), "authorization checks");
        }
        for result in &self.smoke {
            match (result.status, &result.error) {
                (Some(status), _) => info!(url = %result.url, status, "smoke test"),
                (None, Some(error)) => warn!(url = %result.url, %error, "smoke test"),
                (None, None) => {}
            }
        }
        info!(
            "delete all resources with: mesh-provisioner {} --cleanup",
            config.run_id
        );
    }
}

/// Runs every stage in order, halting at the first failure.
///
/// Each provisioning stage first checks whether its resources exist, so re-running with
/// the same configuration resumes after the last completed stage.
pub async fn provision(config: &RunConfig, platform: &Platform) -> Result<Summary> {
    let mut summary = Summary::new(config);
    info!(run_id = %config.run_id, resource_group = %config.resource_group, "provisioning");

    let account = summary
        .stage(Stage::Prerequisites, verified(prereq::check(config, platform)))
        .await?;
    summary.account = Some(account.clone());

    summary
        .stage(Stage::ResourceGroup, unit(infra::resource_group(config, platform, &account)))
        .await?;
    summary
        .stage(Stage::Cluster, unit(infra::cluster(config, platform, &account)))
        .await?;
    summary
        .stage(Stage::Mesh, unit(mesh::install(config, platform)))
        .await?;
    summary
        .stage(Stage::Authz, unit(authz::deploy(config, platform)))
        .await?;

    let endpoint = summary
        .stage(Stage::Dns, mesh::resolve_endpoint(config, platform))
        .await?;
    summary.endpoint = Some(endpoint.clone());

    summary
        .stage(Stage::CertManager, unit(certs::install(config, platform)))
        .await?;
    summary
        .stage(Stage::Issuer, unit(certs::issuer(config, platform, &endpoint.fqdn)))
        .await?;
    summary
        .stage(
            Stage::Certificate,
            unit(certs::certificate(config, platform, &endpoint.fqdn)),
        )
        .await?;
    summary.policy_addon = summary
        .stage(
            Stage::PolicyAddon,
            observe_optional(policy::addon_health(config, platform)),
        )
        .await?;
    summary
        .stage(Stage::Policy, unit(policy::assign(config, platform, &account)))
        .await?;
    summary
        .stage(
            Stage::Gateway,
            unit(routing::configure(config, platform, &endpoint.fqdn)),
        )
        .await?;
    summary
        .stage(Stage::Workload, unit(workload::deploy(config, platform)))
        .await?;
    summary
        .stage(Stage::AuthzBinding, unit(authz::bind(config, platform)))
        .await?;
    summary.authz_checks = summary
        .stage(Stage::AuthzCheck, observe_optional(authz::verify(config, platform)))
        .await?
        .unwrap_or_default();

    summary.compliance = summary
        .stage(Stage::Compliance, observe(policy::report(config, platform)))
        .await?;
    summary.smoke = summary
        .stage(Stage::SmokeTest, observe(smoke::run(platform, &endpoint.fqdn)))
        .await?;

    summary.log();
    Ok(summary)
}

async fn unit(step: impl Future<Output = Result<Outcome>>) -> Result<(Outcome, ())> {
    Ok((step.await?, ()))
}

async fn verified<T>(step: impl Future<Output = Result<T>>) -> Result<(Outcome, T)> {
    Ok((Outcome::Verified, step.await?))
}

/// Observational steps log their own failures and never halt the run.
async fn observe<T>(step: impl Future<Output = T>) -> Result<(Outcome, T)> {
    Ok((Outcome::Verified, step.await))
}

/// Like [`observe`], for steps of optional components that yield `None` when disabled.
async fn observe_optional<T>(
    step: impl Future<Output = Option<T>>,
) -> Result<(Outcome, Option<T>)> {
    let value = step.await;
    let outcome = if value.is_some() {
        Outcome::Verified
    } else {
        Outcome::Disabled
    };
    Ok((outcome, value))
}
