use crate::{poll::Schedule, Error};
use rand::Rng;
use std::{fmt, str::FromStr, time::Duration};

/// Identifies one provisioning run. Every Azure and Kubernetes name is derived from it, so
/// re-running with the same id targets the same resources.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunId(String);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum IssuerMode {
    Staging,
    #[default]
    Production,
}

/// Enforcement effect of the admission policy assignment.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolicyEffect {
    #[default]
    Audit,
    Deny,
}

/// The complete, immutable description of a run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub run_id: RunId,
    pub location: String,
    pub resource_group: String,
    pub cluster_name: String,
    pub kubernetes_version: String,
    pub node_count: u16,
    pub node_vm_size: String,
    pub mesh: MeshConfig,
    pub cert_manager: CertManagerConfig,
    pub workload: WorkloadConfig,
    pub authz: Option<AuthzConfig>,
    pub policy: Option<PolicyConfig>,
    pub timeouts: Timeouts,
}

#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub version: String,
    pub profile: String,
    pub namespace: String,
    pub control_plane: String,
    pub ingress: String,
    pub gateway_api_version: String,
}

#[derive(Clone, Debug)]
pub struct CertManagerConfig {
    pub chart_version: String,
    pub namespace: String,
    pub issuer_mode: IssuerMode,
    pub certificate_name: String,
    pub certificate_duration: String,
    pub certificate_renew_before: String,
}

#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub namespace: String,
    pub frontend: String,
    /// Service kept behind external authorization in the end-to-end check.
    pub protected: String,
    /// Port every sample service listens on.
    pub service_port: u16,
    pub deployments: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct AuthzConfig {
    pub namespace: String,
    pub image: String,
    pub provider: String,
    pub grpc_port: u16,
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub definition_id: String,
    pub effect: PolicyEffect,
    pub await_propagation: bool,
}

/// Poll schedules and settle delays used throughout a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub resource: Schedule,
    pub cluster: Schedule,
    pub address: Schedule,
    pub certificate: Schedule,
    pub policy: Schedule,
    pub cluster_settle: Duration,
    pub load_balancer_settle: Duration,
    pub workload_settle: Duration,
}

pub const NAME_PREFIX: &str = "aks-sample";

// === impl RunId ===

impl RunId {
    pub const LEN: usize = 5;

    /// Generates a random id. The first character is always a letter so that the id is
    /// usable as a DNS label on its own.
    pub fn generate() -> Self {
        let rng = &mut rand::thread_rng();
        let first = rng.gen_range(b'a'..=b'z') as char;
        let id = std::iter::once(first)
            .chain((1..Self::LEN).map(|_| rng.sample(LowercaseAlphanumeric) as char))
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Azure requires public IP DNS labels to start with a letter.
    pub fn dns_label(&self) -> String {
        if self.0.starts_with(|c: char| c.is_ascii_lowercase()) {
            self.0.clone()
        } else {
            format!("r{}", self.0)
        }
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::InvalidRunId {
            value: s.to_string(),
            reason,
        };
        if s.chars().count() != Self::LEN {
            return Err(invalid("must be exactly 5 characters"));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(invalid("must contain only lowercase letters and digits"));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct LowercaseAlphanumeric;

// Modified from `rand::distributions::Alphanumeric`
//
// Copyright 2018 Developers of the Rand project
// Copyright (c) 2014 The Rust Project Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
impl rand::distributions::Distribution<u8> for LowercaseAlphanumeric {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        const RANGE: u32 = 26 + 10;
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        loop {
            let var = rng.next_u32() >> (32 - 6);
            if var < RANGE {
                return CHARSET[var as usize];
            }
        }
    }
}

// === impl IssuerMode ===

impl IssuerMode {
    const STAGING_SERVER: &'static str = "https://acme-staging-v02.api.letsencrypt.org/directory";
    const PRODUCTION_SERVER: &'static str = "https://acme-v02.api.letsencrypt.org/directory";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn acme_server(&self) -> &'static str {
        match self {
            Self::Staging => Self::STAGING_SERVER,
            Self::Production => Self::PRODUCTION_SERVER,
        }
    }

    pub fn issuer_name(&self) -> String {
        format!("letsencrypt-{}", self.as_str())
    }
}

impl FromStr for IssuerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            _ => Err(Error::invalid("issuer mode", s, "staging or production")),
        }
    }
}

impl fmt::Display for IssuerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl PolicyEffect ===

impl PolicyEffect {
    /// The parameter value Azure Policy expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audit => "Audit",
            Self::Deny => "Deny",
        }
    }
}

impl FromStr for PolicyEffect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audit" => Ok(Self::Audit),
            "deny" => Ok(Self::Deny),
            _ => Err(Error::invalid("policy effect", s, "audit or deny")),
        }
    }
}

impl fmt::Display for PolicyEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl RunConfig ===

impl RunConfig {
    pub fn new(run_id: RunId) -> Self {
        let resource_group = format!("{NAME_PREFIX}-{run_id}");
        let cluster_name = format!("{resource_group}-aks");
        Self {
            run_id,
            location: "eastus".to_string(),
            resource_group,
            cluster_name,
            kubernetes_version: "1.31.6".to_string(),
            node_count: 1,
            node_vm_size: "Standard_DS2_v2".to_string(),
            mesh: MeshConfig::default(),
            cert_manager: CertManagerConfig::default(),
            workload: WorkloadConfig::default(),
            authz: Some(AuthzConfig::default()),
            policy: Some(PolicyConfig::default()),
            timeouts: Timeouts::default(),
        }
    }

    pub fn issuer_name(&self) -> String {
        self.cert_manager.issuer_mode.issuer_name()
    }

    pub fn policy_assignment_name(&self) -> String {
        format!("demo-policy-assignment-{}", self.run_id)
    }

    pub fn gateway_api_bundle_url(&self) -> String {
        format!(
            "https://github.com/kubernetes-sigs/gateway-api/releases/download/{}/standard-install.yaml",
            self.mesh.gateway_api_version
        )
    }

    /// The sample application is pinned to the installed mesh release.
    pub fn workload_manifest_url(&self) -> String {
        format!(
            "https://raw.githubusercontent.com/istio/istio/{}/samples/bookinfo/platform/kube/bookinfo.yaml",
            self.mesh.version
        )
    }

    /// Azure resource id of the managed cluster, used as the policy assignment scope.
    pub fn cluster_scope(&self, subscription_id: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}",
            subscription_id, self.resource_group, self.cluster_name
        )
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            version: "1.24.4".to_string(),
            profile: "demo".to_string(),
            namespace: "istio-system".to_string(),
            control_plane: "istiod".to_string(),
            ingress: "istio-ingressgateway".to_string(),
            gateway_api_version: "v1.2.1".to_string(),
        }
    }
}

impl Default for CertManagerConfig {
    fn default() -> Self {
        Self {
            chart_version: "v1.17.0".to_string(),
            namespace: "cert-manager".to_string(),
            issuer_mode: IssuerMode::default(),
            certificate_name: "istio-ingressgateway-certs".to_string(),
            certificate_duration: "2160h".to_string(),
            certificate_renew_before: "360h".to_string(),
        }
    }
}

impl CertManagerConfig {
    pub const DEPLOYMENTS: [&'static str; 3] = [
        "cert-manager",
        "cert-manager-cainjector",
        "cert-manager-webhook",
    ];
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            namespace: "sample-app".to_string(),
            frontend: "productpage".to_string(),
            protected: "reviews".to_string(),
            service_port: 9080,
            deployments: [
                "productpage-v1",
                "reviews-v1",
                "reviews-v2",
                "reviews-v3",
                "ratings-v1",
                "details-v1",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl WorkloadConfig {
    /// The deployment that serves the front-end service.
    pub fn frontend_deployment(&self) -> String {
        format!("{}-v1", self.frontend)
    }

    pub fn protected_deployment(&self) -> String {
        format!("{}-v1", self.protected)
    }

    /// In-mesh URL of a sample service.
    pub fn service_url(&self, service: &str, path: &str) -> String {
        format!("http://{service}:{}{path}", self.service_port)
    }
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            namespace: "opa".to_string(),
            image: "openpolicyagent/opa:0.61.0-envoy".to_string(),
            provider: "opa.local".to_string(),
            grpc_port: 9191,
        }
    }
}

impl AuthzConfig {
    pub fn service_host(&self) -> String {
        format!("opa.{}.svc.cluster.local", self.namespace)
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            // Kubernetes cluster containers should not use forbidden sysctl interfaces.
            definition_id: "56d0a13f-712f-466b-8416-56fb354fb823".to_string(),
            effect: PolicyEffect::default(),
            await_propagation: false,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            resource: Schedule::new(30, Duration::from_secs(5)),
            cluster: Schedule::new(30, Duration::from_secs(10)),
            address: Schedule::new(30, Duration::from_secs(10)),
            certificate: Schedule::new(30, Duration::from_secs(10)),
            policy: Schedule::new(90, Duration::from_secs(10)),
            cluster_settle: Duration::from_secs(30),
            load_balancer_settle: Duration::from_secs(60),
            workload_settle: Duration::from_secs(60),
        }
    }
}
