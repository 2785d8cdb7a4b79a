//! An in-memory platform that stands in for Azure, the cluster, and the CLI tools.
//!
//! The cluster simulates the controllers a run depends on: deployments become ready as soon
//! as they are applied, issuers report `Ready`, certificates materialize their secret, pods
//! start running, and `istioctl`/`helm` installs create the objects the real charts would.
//! Requests sent with `kubectl exec` are denied the way the mesh would deny them once the
//! authorization policy and the workload label are in place.

#![allow(dead_code)]

use async_trait::async_trait;
use mesh_provisioner_core::{
    Account, Cloud, Cluster, ClusterSpec, Error, Platform, PolicyAssignment, Probe, PublicIp,
    ResourceRef, Result, Tool, Toolchain,
};
use mesh_provisioner_k8s_api::parse_documents;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub const INGRESS_IP: [u8; 4] = [20, 81, 1, 2];
pub const SUBSCRIPTION_ID: &str = "00000000-1111-2222-3333-444444444444";
const CLUSTER_SCOPED: [&str; 4] = [
    "Namespace",
    "Node",
    "ClusterIssuer",
    "CustomResourceDefinition",
];

pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("mesh_provisioner=debug,warn")
        .try_init();
}

#[derive(Clone)]
pub struct MockPlatform {
    pub cloud: Arc<MockCloud>,
    pub cluster: Arc<MockCluster>,
    pub tools: Arc<MockTools>,
    pub probe: Arc<MockProbe>,
}

#[derive(Default)]
pub struct MockCloud {
    calls: AtomicU32,
    pub creates: AtomicU32,
    cluster: Arc<MockCluster>,
    state: Mutex<CloudState>,
}

#[derive(Default)]
struct CloudState {
    signed_out: bool,
    resource_groups: BTreeMap<String, BTreeMap<String, String>>,
    clusters: BTreeSet<(String, String)>,
    ips: Vec<PublicIp>,
    assignments: BTreeMap<String, PolicyAssignment>,
    /// Provisioning state checks that still report `Creating` after creation.
    pending_polls: u32,
    state_polls: u32,
    nodes_not_ready: bool,
    addon_pending: bool,
}

#[derive(Default)]
pub struct MockCluster {
    calls: AtomicU32,
    objects: Mutex<BTreeMap<ResourceRef, Value>>,
    stuck: Mutex<BTreeSet<String>>,
    urls: Mutex<Vec<String>>,
}

pub struct MockTools {
    calls: AtomicU32,
    cluster: Arc<MockCluster>,
    available: Mutex<BTreeSet<Tool>>,
    runs: Mutex<Vec<(Tool, Vec<String>)>>,
    authz_bypassed: Mutex<bool>,
}

#[derive(Default)]
pub struct MockProbe {
    calls: AtomicU32,
    unreachable: Mutex<bool>,
}

// === impl MockPlatform ===

impl MockPlatform {
    pub fn new() -> Self {
        let cluster = Arc::new(MockCluster::default());
        let cloud = Arc::new(MockCloud {
            cluster: cluster.clone(),
            ..Default::default()
        });
        cloud.set_public_ips(vec![
            public_ip("kubernetes-a1b2c3", Some(INGRESS_IP.into())),
            public_ip("outbound-d4e5f6", Some([20, 81, 9, 9].into())),
        ]);
        let tools = Arc::new(MockTools {
            calls: AtomicU32::new(0),
            cluster: cluster.clone(),
            available: Mutex::new([Tool::Az, Tool::Kubectl].into_iter().collect()),
            runs: Mutex::new(Vec::new()),
            authz_bypassed: Mutex::new(false),
        });
        Self {
            cloud,
            cluster,
            tools,
            probe: Arc::new(MockProbe::default()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            cloud: self.cloud.clone(),
            cluster: self.cluster.clone(),
            tools: self.tools.clone(),
            probe: self.probe.clone(),
        }
    }

    /// Every call made into any external system.
    pub fn calls(&self) -> u32 {
        self.cloud.calls.load(Ordering::SeqCst)
            + self.cluster.calls.load(Ordering::SeqCst)
            + self.tools.calls.load(Ordering::SeqCst)
            + self.probe.calls.load(Ordering::SeqCst)
    }
}

pub fn public_ip(name: &str, address: Option<IpAddr>) -> PublicIp {
    PublicIp {
        name: name.to_string(),
        address,
        dns_label: None,
        fqdn: None,
    }
}

// === impl MockCloud ===

impl MockCloud {
    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_public_ips(&self, ips: Vec<PublicIp>) {
        self.state.lock().ips = ips;
    }

    pub fn sign_out(&self) {
        self.state.lock().signed_out = true;
    }

    pub fn resource_group_tags(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().resource_groups.get(name).cloned()
    }

    pub fn assignment(&self, name: &str) -> Option<PolicyAssignment> {
        self.state.lock().assignments.get(name).cloned()
    }

    /// A new cluster reports `Creating` for this many more state checks.
    pub fn delay_provisioning(&self, polls: u32) {
        self.state.lock().pending_polls = polls;
    }

    /// Nodes of new clusters never become ready.
    pub fn hold_nodes_not_ready(&self) {
        self.state.lock().nodes_not_ready = true;
    }

    /// Policy add-on pods of new clusters stay pending.
    pub fn hold_addon_pending(&self) {
        self.state.lock().addon_pending = true;
    }

    pub fn state_polls(&self) -> u32 {
        self.state.lock().state_polls
    }
}

#[async_trait]
impl Cloud for MockCloud {
    async fn account(&self) -> Result<Account> {
        self.call();
        if self.state.lock().signed_out {
            return Err(Error::NotAuthenticated("run 'az login' first".to_string()));
        }
        Ok(Account {
            subscription_id: SUBSCRIPTION_ID.to_string(),
            subscription_name: "Demo Subscription".to_string(),
            user: "operator@example.com".to_string(),
        })
    }

    async fn resource_group_exists(&self, name: &str) -> Result<bool> {
        self.call();
        Ok(self.state.lock().resource_groups.contains_key(name))
    }

    async fn create_resource_group(
        &self,
        name: &str,
        _location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.call();
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .resource_groups
            .insert(name.to_string(), tags.clone());
        Ok(())
    }

    async fn cluster_exists(&self, resource_group: &str, name: &str) -> Result<bool> {
        self.call();
        Ok(self
            .state
            .lock()
            .clusters
            .contains(&(resource_group.to_string(), name.to_string())))
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<()> {
        self.call();
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if !state.resource_groups.contains_key(&spec.resource_group) {
            return Err(Error::provisioning(
                "az aks create",
                format!("resource group {} not found", spec.resource_group),
            ));
        }
        state
            .clusters
            .insert((spec.resource_group.clone(), spec.name.clone()));
        let node_ready = if state.nodes_not_ready { "False" } else { "True" };
        let addon_phase = if state.addon_pending { "Pending" } else { "Running" };
        drop(state);

        self.cluster.insert(json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": { "name": "aks-nodepool1-00000000-vmss000000" },
            "status": { "conditions": [{ "type": "Ready", "status": node_ready }] },
        }));

        // The azure-policy add-on is enabled at creation.
        let pods = [
            ("kube-system", "azure-policy-7d9c8", "azure-policy"),
            ("kube-system", "azure-policy-webhook-5f6b4", "azure-policy-webhook"),
            ("gatekeeper-system", "gatekeeper-audit-6c7d8", "gatekeeper"),
            ("gatekeeper-system", "gatekeeper-controller-9a8b7", "gatekeeper"),
        ];
        for (namespace, name, app) in pods {
            self.cluster.insert(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": name, "namespace": namespace, "labels": { "app": app } },
                "status": { "phase": addon_phase },
            }));
        }
        Ok(())
    }

    async fn cluster_provisioning_state(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<String> {
        self.call();
        let mut state = self.state.lock();
        state.state_polls += 1;
        let exists = state
            .clusters
            .contains(&(resource_group.to_string(), name.to_string()));
        if !exists || state.pending_polls > 0 {
            state.pending_polls = state.pending_polls.saturating_sub(1);
            return Ok("Creating".to_string());
        }
        Ok("Succeeded".to_string())
    }

    async fn fetch_credentials(&self, _resource_group: &str, _name: &str) -> Result<()> {
        self.call();
        Ok(())
    }

    async fn node_resource_group(&self, resource_group: &str, name: &str) -> Result<String> {
        self.call();
        Ok(format!("MC_{resource_group}_{name}_eastus"))
    }

    async fn public_ips(&self, _resource_group: &str) -> Result<Vec<PublicIp>> {
        self.call();
        Ok(self.state.lock().ips.clone())
    }

    async fn assign_dns_label(
        &self,
        _resource_group: &str,
        ip: &str,
        label: &str,
    ) -> Result<String> {
        self.call();
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let ip = state
            .ips
            .iter_mut()
            .find(|i| i.name == ip)
            .ok_or_else(|| Error::provisioning("az network public-ip update", "not found"))?;
        let fqdn = format!("{label}.eastus.cloudapp.azure.com");
        ip.dns_label = Some(label.to_string());
        ip.fqdn = Some(fqdn.clone());
        Ok(fqdn)
    }

    async fn policy_assignment_exists(&self, name: &str, _scope: &str) -> Result<bool> {
        self.call();
        Ok(self.state.lock().assignments.contains_key(name))
    }

    async fn assign_policy(&self, assignment: &PolicyAssignment) -> Result<()> {
        self.call();
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .assignments
            .insert(assignment.name.clone(), assignment.clone());

        // The policy add-on translates the assignment into a Gatekeeper constraint.
        self.cluster.insert(json!({
            "apiVersion": "constraints.gatekeeper.sh/v1beta1",
            "kind": "K8sAzureV2ForbiddenSysctl",
            "metadata": { "name": "azurepolicy-forbidden-sysctl" },
            "spec": { "enforcementAction": assignment.effect.as_str().to_ascii_lowercase() },
            "status": {
                "totalViolations": 1,
                "violations": [{
                    "kind": "Pod",
                    "name": "tuned",
                    "namespace": "default",
                    "message": "sysctl kernel.shm_rmid_forced is not allowed",
                }],
            },
        }));
        Ok(())
    }

    async fn delete_resource_group(&self, name: &str) -> Result<()> {
        self.call();
        let mut state = self.state.lock();
        state.resource_groups.remove(name);
        state.clusters.retain(|(rg, _)| rg != name);
        Ok(())
    }
}

// === impl MockCluster ===

impl MockCluster {
    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Deployments with this name never report ready replicas.
    pub fn stick(&self, deployment: &str) {
        self.stuck.lock().insert(deployment.to_string());
    }

    /// Lets a stuck deployment become ready.
    pub fn unstick(&self, deployment: &str) {
        self.stuck.lock().remove(deployment);
        let stuck = self
            .objects
            .lock()
            .iter()
            .filter(|(r, _)| r.kind == "Deployment" && r.name == deployment)
            .map(|(_, obj)| obj.clone())
            .collect::<Vec<_>>();
        for obj in stuck {
            self.insert(obj);
        }
    }

    /// True once requests to the deployment's pods go through the external authorizer.
    pub fn authz_enforced(&self, namespace: &str, deployment: &str) -> bool {
        let policy = ResourceRef::new(
            "security.istio.io/v1",
            "AuthorizationPolicy",
            Some("istio-system"),
            "opa-external-authz",
        );
        let labeled = self
            .object(&ResourceRef::deployment(namespace, deployment))
            .and_then(|d| d.pointer("/spec/template/metadata/labels/opa-authz").cloned())
            == Some(json!("enabled"));
        labeled && self.object(&policy).is_some()
    }

    pub fn object(&self, resource: &ResourceRef) -> Option<Value> {
        self.objects.lock().get(resource).cloned()
    }

    pub fn applied_urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Stores an object as its controller would leave it.
    pub fn insert(&self, mut obj: Value) -> ResourceRef {
        let Some(resource) = ResourceRef::from_manifest(&obj) else {
            panic!("object must be named: {obj}");
        };
        match resource.kind.as_str() {
            "Deployment" => {
                let replicas = obj
                    .pointer("/spec/replicas")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                let ready = if self.stuck.lock().contains(&resource.name) {
                    0
                } else {
                    replicas
                };
                obj["status"] = json!({ "replicas": replicas, "readyReplicas": ready });
            }
            "Pod" => {
                if obj.get("status").is_none() {
                    obj["status"] = json!({
                        "phase": "Running",
                        "conditions": [{ "type": "Ready", "status": "True" }],
                    });
                }
            }
            "ClusterIssuer" => {
                obj["status"] = json!({ "conditions": [{ "type": "Ready", "status": "True" }] });
            }
            "Certificate" => {
                if let (Some(ns), Some(secret)) = (
                    resource.namespace.as_deref(),
                    obj.pointer("/spec/secretName").and_then(Value::as_str),
                ) {
                    self.insert(json!({
                        "apiVersion": "v1",
                        "kind": "Secret",
                        "metadata": { "name": secret, "namespace": ns },
                        "type": "kubernetes.io/tls",
                    }));
                }
            }
            _ => {}
        }
        self.objects.lock().insert(resource.clone(), obj);
        resource
    }

    fn deployment(&self, namespace: &str, name: &str) {
        self.insert(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "namespace": namespace },
            "spec": { "replicas": 1, "selector": {}, "template": {} },
        }));
    }

    fn namespace(&self, name: &str) {
        self.insert(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
        }));
    }

    fn install_mesh(&self) {
        self.namespace("istio-system");
        self.deployment("istio-system", "istiod");
        self.deployment("istio-system", "istio-ingressgateway");
        let ip = IpAddr::from(INGRESS_IP).to_string();
        self.insert(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "istio-ingressgateway", "namespace": "istio-system" },
            "spec": { "type": "LoadBalancer" },
            "status": { "loadBalancer": { "ingress": [{ "ip": ip }] } },
        }));
    }

    fn install_cert_manager(&self) {
        self.namespace("cert-manager");
        for name in ["cert-manager", "cert-manager-cainjector", "cert-manager-webhook"] {
            self.deployment("cert-manager", name);
        }
    }

    fn install_bookinfo(&self, namespace: &str) {
        for name in [
            "details-v1",
            "ratings-v1",
            "reviews-v1",
            "reviews-v2",
            "reviews-v3",
            "productpage-v1",
        ] {
            self.deployment(namespace, name);
        }
    }
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>> {
        self.call();
        Ok(self.object(resource))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>> {
        self.call();
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|(r, _)| {
                r.api_version == api_version
                    && r.kind == kind
                    && (namespace.is_none() || r.namespace.as_deref() == namespace)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn list_group(&self, group: &str) -> Result<Vec<Value>> {
        self.call();
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|(r, _)| r.group_version().0 == group)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn apply(
        &self,
        manifest: &str,
        default_namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>> {
        self.call();
        let mut applied = Vec::new();
        for mut doc in parse_documents(manifest)? {
            let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
            if !CLUSTER_SCOPED.contains(&kind) && doc.pointer("/metadata/namespace").is_none() {
                let ns = default_namespace.ok_or_else(|| {
                    Error::provisioning("apply", format!("{kind} has no namespace"))
                })?;
                doc["metadata"]["namespace"] = ns.into();
            }
            applied.push(self.insert(doc));
        }
        Ok(applied)
    }

    async fn apply_url(
        &self,
        url: &str,
        default_namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>> {
        self.call();
        self.urls.lock().push(url.to_string());
        if url.contains("bookinfo") {
            let ns = default_namespace.unwrap_or("default");
            self.install_bookinfo(ns);
        }
        Ok(Vec::new())
    }

    async fn merge_patch(&self, resource: &ResourceRef, patch: &Value) -> Result<()> {
        self.call();
        let mut objects = self.objects.lock();
        let obj = objects
            .get_mut(resource)
            .ok_or_else(|| Error::provisioning("patch", format!("{resource} not found")))?;
        merge(obj, patch);
        Ok(())
    }
}

// === impl MockTools ===

impl MockTools {
    pub fn runs(&self, tool: Tool) -> Vec<Vec<String>> {
        self.runs
            .lock()
            .iter()
            .filter(|(t, _)| *t == tool)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn remove(&self, tool: Tool) {
        self.available.lock().remove(&tool);
    }

    /// Requests reach the workloads without passing the external authorizer.
    pub fn bypass_authz(&self) {
        *self.authz_bypassed.lock() = true;
    }

    /// The status code `curl` prints for a request run inside the client pod.
    fn respond(&self, args: &[String]) -> String {
        let namespace = args
            .iter()
            .position(|a| a == "-n")
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
            .unwrap_or("default");
        let url = args.last().map(String::as_str).unwrap_or_default();
        let authorized = args.iter().any(|a| a == "x-user-authorized: true");
        let denied = url.contains("/reviews/")
            && !authorized
            && !*self.authz_bypassed.lock()
            && self.cluster.authz_enforced(namespace, "reviews-v1");
        if denied { "403" } else { "200" }.to_string()
    }
}

#[async_trait]
impl Toolchain for MockTools {
    async fn is_available(&self, tool: Tool) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.available.lock().contains(&tool))
    }

    async fn version(&self, tool: Tool) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(format!("{tool} v0.0.0-test"))
    }

    async fn install(&self, tool: Tool, _version: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.available.lock().insert(tool);
        Ok(())
    }

    async fn run(&self, tool: Tool, args: &[String]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.runs.lock().push((tool, args.to_vec()));
        match (tool, args.first().map(String::as_str)) {
            (Tool::Istioctl, Some("install")) => self.cluster.install_mesh(),
            (Tool::Helm, Some("install")) => self.cluster.install_cert_manager(),
            (Tool::Kubectl, Some("exec")) => return Ok(self.respond(args)),
            (Tool::Kubectl, Some("logs")) => {
                return Ok("{\"decision_id\":\"4f1c\",\"result\":false}\n".to_string())
            }
            _ => {}
        }
        Ok(String::new())
    }
}

// === impl MockProbe ===

impl MockProbe {
    pub fn set_unreachable(&self) {
        *self.unreachable.lock() = true;
    }
}

#[async_trait]
impl Probe for MockProbe {
    async fn get(&self, url: &str) -> Result<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.unreachable.lock() {
            return Err(Error::provisioning(format!("GET {url}"), "connection timed out"));
        }
        Ok(200)
    }
}
