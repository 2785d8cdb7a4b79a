#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A [`Cloud`] implemented on top of the Azure CLI.

use mesh_provisioner_core::{
    exec::Exec, Account, Cloud, ClusterSpec, Error, PolicyAssignment, ProvisioningExt, PublicIp,
    Result,
};
use serde::Deserialize;
use std::{collections::BTreeMap, ffi::OsString};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct AzCli {
    program: OsString,
}

#[derive(Debug, Deserialize)]
struct AccountJson {
    id: String,
    name: String,
    user: Option<UserJson>,
}

#[derive(Debug, Deserialize)]
struct UserJson {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIpJson {
    name: String,
    ip_address: Option<String>,
    dns_settings: Option<DnsSettingsJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DnsSettingsJson {
    domain_name_label: Option<String>,
    fqdn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedJson {
    name: String,
}

// === impl AzCli ===

impl Default for AzCli {
    fn default() -> Self {
        Self::new("az")
    }
}

impl AzCli {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn az<I, S>(&self, args: I) -> Exec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Exec::new(self.program.clone())
            .args(args)
            .arg("--only-show-errors")
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, exec: Exec) -> Result<T> {
        let exec = exec.args(["--output", "json"]);
        let out = exec.run().await?;
        serde_json::from_str(&out).or_provisioning(|| exec.to_string())
    }

    async fn tsv(&self, exec: Exec) -> Result<String> {
        let out = exec.args(["--output", "tsv"]).run().await?;
        Ok(out.trim().to_string())
    }
}

#[async_trait::async_trait]
impl Cloud for AzCli {
    async fn account(&self) -> Result<Account> {
        let out = self
            .az(["account", "show", "--output", "json"])
            .output()
            .await?;
        if !out.success {
            return Err(Error::NotAuthenticated(format!(
                "{}; run 'az login' first",
                out.stderr.trim()
            )));
        }
        parse_account(&out.stdout)
    }

    async fn resource_group_exists(&self, name: &str) -> Result<bool> {
        let out = self.az(["group", "exists", "--name", name]).run().await?;
        Ok(out.trim() == "true")
    }

    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        info!(resource_group = %name, %location, "creating resource group");
        self.az(["group", "create", "--name", name, "--location", location])
            .arg("--tags")
            .args(tag_args(tags))
            .run()
            .await?;
        Ok(())
    }

    async fn cluster_exists(&self, resource_group: &str, name: &str) -> Result<bool> {
        let clusters: Vec<NamedJson> = self
            .json(self.az(["aks", "list", "--resource-group", resource_group]))
            .await?;
        Ok(clusters.iter().any(|c| c.name == name))
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<()> {
        info!(
            cluster = %spec.name,
            version = %spec.kubernetes_version,
            nodes = spec.node_count,
            "creating cluster"
        );
        self.az(create_cluster_args(spec)).run().await?;
        Ok(())
    }

    async fn cluster_provisioning_state(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<String> {
        self.tsv(self.az([
            "aks",
            "show",
            "--resource-group",
            resource_group,
            "--name",
            name,
            "--query",
            "provisioningState",
        ]))
        .await
    }

    async fn fetch_credentials(&self, resource_group: &str, name: &str) -> Result<()> {
        self.az([
            "aks",
            "get-credentials",
            "--resource-group",
            resource_group,
            "--name",
            name,
            "--overwrite-existing",
        ])
        .run()
        .await?;
        debug!(cluster = %name, "credentials written to kubeconfig");
        Ok(())
    }

    async fn node_resource_group(&self, resource_group: &str, name: &str) -> Result<String> {
        self.tsv(self.az([
            "aks",
            "show",
            "--resource-group",
            resource_group,
            "--name",
            name,
            "--query",
            "nodeResourceGroup",
        ]))
        .await
    }

    async fn public_ips(&self, resource_group: &str) -> Result<Vec<PublicIp>> {
        let exec = self
            .az(["network", "public-ip", "list", "--resource-group", resource_group])
            .args(["--output", "json"]);
        let out = exec.run().await?;
        parse_public_ips(&out).or_provisioning(|| exec.to_string())
    }

    async fn assign_dns_label(
        &self,
        resource_group: &str,
        ip: &str,
        label: &str,
    ) -> Result<String> {
        let updated: PublicIpJson = self
            .json(self.az([
                "network",
                "public-ip",
                "update",
                "--resource-group",
                resource_group,
                "--name",
                ip,
                "--dns-name",
                label,
            ]))
            .await?;
        updated
            .dns_settings
            .and_then(|dns| dns.fqdn)
            .ok_or_else(|| Error::provisioning("az network public-ip update", "no FQDN assigned"))
    }

    async fn policy_assignment_exists(&self, name: &str, scope: &str) -> Result<bool> {
        let assignments: Vec<NamedJson> = self
            .json(self.az(["policy", "assignment", "list", "--scope", scope]))
            .await?;
        Ok(assignments.iter().any(|a| a.name == name))
    }

    async fn assign_policy(&self, assignment: &PolicyAssignment) -> Result<()> {
        info!(name = %assignment.name, effect = %assignment.effect, "assigning policy");
        self.az(assign_policy_args(assignment)).run().await?;
        Ok(())
    }

    async fn delete_resource_group(&self, name: &str) -> Result<()> {
        info!(resource_group = %name, "deleting resource group");
        self.az(["group", "delete", "--name", name, "--yes"])
            .run()
            .await?;
        Ok(())
    }
}

fn tag_args(tags: &BTreeMap<String, String>) -> Vec<String> {
    tags.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn create_cluster_args(spec: &ClusterSpec) -> Vec<String> {
    let mut args = [
        "aks",
        "create",
        "--resource-group",
        &spec.resource_group,
        "--name",
        &spec.name,
        "--kubernetes-version",
        &spec.kubernetes_version,
        "--node-count",
        &spec.node_count.to_string(),
        "--node-vm-size",
        &spec.node_vm_size,
        "--enable-managed-identity",
        "--network-plugin",
        "azure",
        "--network-policy",
        "azure",
        "--max-pods",
        "50",
        "--enable-addons",
        "azure-policy",
        "--generate-ssh-keys",
    ]
    .map(String::from)
    .to_vec();
    if !spec.tags.is_empty() {
        args.push("--tags".to_string());
        args.extend(tag_args(&spec.tags));
    }
    args
}

fn assign_policy_args(assignment: &PolicyAssignment) -> Vec<String> {
    [
        "policy",
        "assignment",
        "create",
        "--name",
        &assignment.name,
        "--display-name",
        &assignment.display_name,
        "--policy",
        &assignment.definition_id,
        "--scope",
        &assignment.scope,
        "--params",
        &assignment.parameters.to_string(),
    ]
    .map(String::from)
    .to_vec()
}

fn parse_account(json: &str) -> Result<Account> {
    let account: AccountJson =
        serde_json::from_str(json).or_provisioning(|| "az account show".into())?;
    Ok(Account {
        subscription_id: account.id,
        subscription_name: account.name,
        user: account.user.map(|u| u.name).unwrap_or_default(),
    })
}

fn parse_public_ips(json: &str) -> serde_json::Result<Vec<PublicIp>> {
    let ips: Vec<PublicIpJson> = serde_json::from_str(json)?;
    Ok(ips
        .into_iter()
        .map(|ip| {
            let (dns_label, fqdn) = ip
                .dns_settings
                .map(|dns| (dns.domain_name_label, dns.fqdn))
                .unwrap_or_default();
            PublicIp {
                name: ip.name,
                address: ip.ip_address.and_then(|addr| addr.parse().ok()),
                dns_label,
                fqdn,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};
    use mesh_provisioner_core::PolicyEffect;

    #[test]
    fn parses_account() {
        let account = parse_account(
            r#"{
                "environmentName": "AzureCloud",
                "id": "00000000-1111-2222-3333-444444444444",
                "isDefault": true,
                "name": "Demo Subscription",
                "state": "Enabled",
                "tenantId": "55555555-6666-7777-8888-999999999999",
                "user": { "name": "operator@example.com", "type": "user" }
            }"#,
        )
        .unwrap();
        assert_eq!(account.subscription_id, "00000000-1111-2222-3333-444444444444");
        assert_eq!(account.subscription_name, "Demo Subscription");
        assert_eq!(account.user, "operator@example.com");
    }

    #[test]
    fn parses_public_ips() {
        let ips = parse_public_ips(
            r#"[
                {
                    "name": "kubernetes-a1b2c3",
                    "ipAddress": "20.81.1.2",
                    "dnsSettings": {
                        "domainNameLabel": "abc12",
                        "fqdn": "abc12.eastus.cloudapp.azure.com"
                    }
                },
                { "name": "outbound", "ipAddress": "20.81.9.9" },
                { "name": "pending" }
            ]"#,
        )
        .unwrap();
        assert_eq!(ips.len(), 3);
        assert_eq!(ips[0].address, Some([20, 81, 1, 2].into()));
        assert_eq!(ips[0].dns_label.as_deref(), Some("abc12"));
        assert_eq!(ips[0].fqdn.as_deref(), Some("abc12.eastus.cloudapp.azure.com"));
        assert_eq!(ips[1].dns_label, None);
        assert_eq!(ips[2].address, None);
    }

    #[test]
    fn cluster_args() {
        let spec = ClusterSpec {
            resource_group: "aks-sample-abc12".to_string(),
            name: "aks-sample-abc12-aks".to_string(),
            kubernetes_version: "1.31.6".to_string(),
            node_count: 1,
            node_vm_size: "Standard_DS2_v2".to_string(),
            tags: convert_args!(btreemap!(
                "CREATED_BY" => "mesh-provisioner",
                "CREATED_DATE" => "2025-01-02",
            )),
        };
        let args = create_cluster_args(&spec);
        let joined = args.join(" ");
        assert!(joined.starts_with(
            "aks create --resource-group aks-sample-abc12 --name aks-sample-abc12-aks"
        ));
        assert!(joined.contains("--kubernetes-version 1.31.6 --node-count 1"));
        assert!(joined.contains("--enable-addons azure-policy"));
        assert!(joined.ends_with("--tags CREATED_BY=mesh-provisioner CREATED_DATE=2025-01-02"));
    }

    #[test]
    fn policy_args() {
        let assignment = PolicyAssignment {
            name: "demo-policy-assignment-abc12".to_string(),
            display_name: "Forbidden sysctl interfaces".to_string(),
            definition_id: "56d0a13f-712f-466b-8416-56fb354fb823".to_string(),
            scope: "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/c"
                .to_string(),
            effect: PolicyEffect::Audit,
            parameters: serde_json::json!({ "effect": { "value": "Audit" } }),
        };
        let args = assign_policy_args(&assignment);
        let params = args.iter().position(|a| a == "--params").unwrap();
        let value: serde_json::Value = serde_json::from_str(&args[params + 1]).unwrap();
        assert_eq!(value["effect"]["value"], "Audit");
        assert_eq!(args[args.iter().position(|a| a == "--scope").unwrap() + 1], assignment.scope);
    }
}
