use crate::pipeline::Outcome;
use mesh_provisioner_core::{
    poll, Account, Cluster, Platform, PolicyAssignment, PolicyConfig, Result, RunConfig,
};
use mesh_provisioner_k8s_api::{
    gatekeeper::{self, ConstraintReport, CONSTRAINTS_GROUP},
    readiness,
};
use serde_json::json;
use tracing::{info, warn};

const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "gatekeeper-system", "azure-arc"];
const FORBIDDEN_SYSCTLS: [&str; 3] = ["kernel.*", "net.*", "user.*"];
const REPORTED_VIOLATIONS: usize = 3;
const ADDON_NAMESPACE: &str = "kube-system";
const ADDON_LABEL: (&str, &str) = ("app", "azure-policy");
const GATEKEEPER_NAMESPACE: &str = "gatekeeper-system";

/// Running pods of the policy add-on and of the Gatekeeper admission controller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddonHealth {
    pub policy_pods: usize,
    pub gatekeeper_pods: usize,
}

// === impl AddonHealth ===

impl AddonHealth {
    pub fn is_running(&self) -> bool {
        self.policy_pods > 0 && self.gatekeeper_pods > 0
    }
}

/// Assigns the forbidden-sysctl admission policy to the cluster.
pub(crate) async fn assign(
    config: &RunConfig,
    platform: &Platform,
    account: &Account,
) -> Result<Outcome> {
    let Some(policy) = &config.policy else {
        return Ok(Outcome::Disabled);
    };
    let cloud = &platform.cloud;
    let assignment = assignment(config, policy, &account.subscription_id);

    let outcome = if cloud
        .policy_assignment_exists(&assignment.name, &assignment.scope)
        .await?
    {
        info!(assignment = %assignment.name, "already assigned");
        Outcome::AlreadyPresent
    } else {
        cloud.assign_policy(&assignment).await?;
        Outcome::Created
    };

    if policy.await_propagation {
        let cluster = &*platform.cluster;
        info!(schedule = %config.timeouts.policy, "waiting for policy to reach the cluster");
        let schedule = config.timeouts.policy;
        poll::await_ready("admission policy constraints", schedule, || async move {
            Ok(!cluster.list_group(CONSTRAINTS_GROUP).await?.is_empty())
        })
        .await?;
        info!("admission policy enforced in cluster");
    } else {
        info!("admission policy may take up to 15 minutes to reach the cluster");
    }
    Ok(outcome)
}

fn assignment(
    config: &RunConfig,
    policy: &PolicyConfig,
    subscription_id: &str,
) -> PolicyAssignment {
    let mut excluded = SYSTEM_NAMESPACES
        .iter()
        .map(|ns| ns.to_string())
        .collect::<Vec<_>>();
    excluded.push(config.mesh.namespace.clone());
    if let Some(authz) = &config.authz {
        excluded.push(authz.namespace.clone());
    }

    PolicyAssignment {
        name: config.policy_assignment_name(),
        display_name: format!("Forbidden sysctl interfaces ({})", config.cluster_name),
        definition_id: policy.definition_id.clone(),
        scope: config.cluster_scope(subscription_id),
        effect: policy.effect,
        parameters: json!({
            "effect": { "value": policy.effect.as_str() },
            "excludedNamespaces": { "value": excluded },
            "forbiddenSysctls": { "value": FORBIDDEN_SYSCTLS },
        }),
    }
}

/// Checks that the policy add-on and Gatekeeper are running. Pods that are still starting
/// right after the cluster was created are reported, never fatal.
pub(crate) async fn addon_health(
    config: &RunConfig,
    platform: &Platform,
) -> Option<AddonHealth> {
    config.policy.as_ref()?;
    let cluster = &*platform.cluster;
    let health = AddonHealth {
        policy_pods: running_pods(cluster, ADDON_NAMESPACE, Some(ADDON_LABEL)).await,
        gatekeeper_pods: running_pods(cluster, GATEKEEPER_NAMESPACE, None).await,
    };
    if health.is_running() {
        info!(
            policy = health.policy_pods,
            gatekeeper = health.gatekeeper_pods,
            "policy add-on running"
        );
    } else {
        warn!(
            policy = health.policy_pods,
            gatekeeper = health.gatekeeper_pods,
            "policy add-on not running yet; it may still be starting"
        );
    }
    Some(health)
}

async fn running_pods(
    cluster: &dyn Cluster,
    namespace: &str,
    label: Option<(&str, &str)>,
) -> usize {
    match cluster.list("v1", "Pod", Some(namespace)).await {
        Ok(pods) => pods
            .iter()
            .filter(|pod| label.map_or(true, |(k, v)| readiness::has_label(pod, k, v)))
            .filter(|pod| readiness::pod_running(pod))
            .count(),
        Err(error) => {
            warn!(%namespace, %error, "unable to list pods");
            0
        }
    }
}

/// Logs the audit results Gatekeeper has recorded so far. Never fails the run.
pub(crate) async fn report(config: &RunConfig, platform: &Platform) -> Vec<ConstraintReport> {
    if config.policy.is_none() {
        return Vec::new();
    }

    let constraints = match platform.cluster.list_group(CONSTRAINTS_GROUP).await {
        Ok(constraints) => constraints,
        Err(error) => {
            warn!(%error, "unable to read policy constraints");
            return Vec::new();
        }
    };

    let reports = constraints
        .iter()
        .filter_map(gatekeeper::constraint_report)
        .collect::<Vec<_>>();
    if reports.is_empty() {
        info!("no policy constraints in the cluster yet");
    }
    for report in &reports {
        info!(
            kind = %report.kind,
            name = %report.name,
            enforcement = report.enforcement_action.as_deref().unwrap_or("deny"),
            violations = report.total_violations,
            "constraint"
        );
        for v in report.violations.iter().take(REPORTED_VIOLATIONS) {
            warn!(
                kind = %v.kind,
                name = %v.name,
                namespace = v.namespace.as_deref().unwrap_or(""),
                message = %v.message,
                "violation"
            );
        }
    }
    reports
}
