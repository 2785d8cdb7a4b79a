use crate::{PolicyEffect, Result};
use std::{collections::BTreeMap, net::IpAddr};

/// The Azure control plane, as used by a provisioning run.
#[async_trait::async_trait]
pub trait Cloud: Send + Sync {
    /// Returns the signed-in account, failing with `NotAuthenticated` if there is none.
    async fn account(&self) -> Result<Account>;

    async fn resource_group_exists(&self, name: &str) -> Result<bool>;

    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn cluster_exists(&self, resource_group: &str, name: &str) -> Result<bool>;

    /// Creates a managed cluster, blocking until the platform reports completion.
    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<()>;

    async fn cluster_provisioning_state(&self, resource_group: &str, name: &str)
        -> Result<String>;

    /// Writes cluster credentials into the default kubeconfig, replacing existing entries.
    async fn fetch_credentials(&self, resource_group: &str, name: &str) -> Result<()>;

    /// The platform-managed resource group holding the cluster's infrastructure.
    async fn node_resource_group(&self, resource_group: &str, name: &str) -> Result<String>;

    async fn public_ips(&self, resource_group: &str) -> Result<Vec<PublicIp>>;

    /// Assigns a DNS label to a public IP and returns the resulting FQDN.
    async fn assign_dns_label(&self, resource_group: &str, ip: &str, label: &str)
        -> Result<String>;

    async fn policy_assignment_exists(&self, name: &str, scope: &str) -> Result<bool>;

    async fn assign_policy(&self, assignment: &PolicyAssignment) -> Result<()>;

    async fn delete_resource_group(&self, name: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub subscription_id: String,
    pub subscription_name: String,
    pub user: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicIp {
    pub name: String,
    pub address: Option<IpAddr>,
    pub dns_label: Option<String>,
    pub fqdn: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSpec {
    pub resource_group: String,
    pub name: String,
    pub kubernetes_version: String,
    pub node_count: u16,
    pub node_vm_size: String,
    pub tags: BTreeMap<String, String>,
}

/// Assignment of a built-in policy definition to a scope.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyAssignment {
    pub name: String,
    pub display_name: String,
    pub definition_id: String,
    pub scope: String,
    pub effect: PolicyEffect,
    pub parameters: serde_json::Value,
}

/// The public IP in `ips` whose address is `address`.
pub fn find_public_ip(ips: &[PublicIp], address: IpAddr) -> Option<&PublicIp> {
    ips.iter().find(|ip| ip.address == Some(address))
}
