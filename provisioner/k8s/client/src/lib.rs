#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A [`Cluster`] backed by the Kubernetes API.
//!
//! The client is created lazily on first use because the kubeconfig it reads is written by
//! the provisioning run itself.

use kube::{
    api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams},
    core::TypeMeta,
    discovery::{verbs, Discovery, Scope},
    Client,
};
use mesh_provisioner_core::{Cluster, Error, ProvisioningExt, ResourceRef, Result};
use mesh_provisioner_k8s_api::parse_documents;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

const FIELD_MANAGER: &str = "mesh-provisioner";

pub struct KubeCluster {
    client: OnceCell<Client>,
    http: reqwest::Client,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            client: OnceCell::new(),
            http,
        }
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .get_or_try_init(|| async {
                debug!("initializing client");
                Client::try_default()
                    .await
                    .or_provisioning(|| "load kubeconfig".into())
            })
            .await
            .cloned()
    }

    async fn discovery(client: &Client) -> Result<Discovery> {
        Discovery::new(client.clone())
            .run()
            .await
            .or_provisioning(|| "api discovery".into())
    }

    fn api(client: Client, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, resource),
            None => Api::all_with(client, resource),
        }
    }

    async fn apply_documents(
        &self,
        docs: Vec<Value>,
        default_namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>> {
        let client = self.client().await?;

        // Namespaces and CRDs go first so that the objects that depend on them resolve.
        let (foundation, rest): (Vec<_>, Vec<_>) = docs.into_iter().partition(|doc| {
            matches!(
                doc.get("kind").and_then(Value::as_str),
                Some("Namespace" | "CustomResourceDefinition")
            )
        });

        let mut applied = Vec::with_capacity(foundation.len() + rest.len());
        for doc in foundation {
            let resource = manifest_ref(&doc)?;
            let ar = api_resource(&resource);
            apply_one(client.clone(), &ar, resource.namespace.as_deref(), &resource, &doc).await?;
            applied.push(resource);
        }

        if rest.is_empty() {
            return Ok(applied);
        }

        let discovery = Self::discovery(&client).await?;
        for mut doc in rest {
            let mut resource = manifest_ref(&doc)?;
            let (group, version) = resource.group_version();
            let gvk = GroupVersionKind::gvk(group, version, &resource.kind);
            let (ar, caps) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
                Error::provisioning(
                    format!("apply {resource}"),
                    format!("unknown resource type {}/{}", resource.api_version, resource.kind),
                )
            })?;

            if caps.scope == Scope::Namespaced && resource.namespace.is_none() {
                let ns = default_namespace.unwrap_or("default");
                if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.insert("namespace".to_string(), ns.into());
                }
                resource.namespace = Some(ns.to_string());
            }

            apply_one(client.clone(), &ar, resource.namespace.as_deref(), &resource, &doc).await?;
            applied.push(resource);
        }

        Ok(applied)
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>> {
        let client = self.client().await?;
        let ar = api_resource(resource);
        let obj = Self::api(client, &ar, resource.namespace.as_deref())
            .get_opt(&resource.name)
            .await
            .or_provisioning(|| format!("get {resource}"))?;
        obj.map(|obj| to_value(obj, &ar)).transpose()
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>> {
        let client = self.client().await?;
        let ar = api_resource(&ResourceRef::new(api_version, kind, namespace, ""));
        list_all(Self::api(client, &ar, namespace), &ar).await
    }

    async fn list_group(&self, group: &str) -> Result<Vec<Value>> {
        let client = self.client().await?;
        let discovery = Discovery::new(client.clone())
            .filter(&[group])
            .run()
            .await
            .or_provisioning(|| format!("discover {group}"))?;

        let mut objects = Vec::new();
        for api_group in discovery.groups() {
            for (ar, caps) in api_group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) {
                    continue;
                }
                let api = Api::<DynamicObject>::all_with(client.clone(), &ar);
                objects.extend(list_all(api, &ar).await?);
            }
        }
        Ok(objects)
    }

    async fn apply(
        &self,
        manifest: &str,
        default_namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>> {
        let docs = parse_documents(manifest)?;
        self.apply_documents(docs, default_namespace).await
    }

    async fn apply_url(
        &self,
        url: &str,
        default_namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>> {
        info!(%url, "fetching manifest");
        let body = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|rsp| rsp.error_for_status())
            .or_provisioning(|| format!("fetch {url}"))?
            .text()
            .await
            .or_provisioning(|| format!("fetch {url}"))?;
        let docs = parse_documents(&body)?;
        debug!(%url, documents = docs.len(), "fetched manifest");
        self.apply_documents(docs, default_namespace).await
    }

    async fn merge_patch(&self, resource: &ResourceRef, patch: &Value) -> Result<()> {
        let client = self.client().await?;
        let ar = api_resource(resource);
        Self::api(client, &ar, resource.namespace.as_deref())
            .patch(&resource.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .or_provisioning(|| format!("patch {resource}"))?;
        debug!(%resource, "patched");
        Ok(())
    }
}

/// Builds an `ApiResource` from a kind without discovery. Only used for built-in kinds and
/// CRD-backed kinds whose plural is the lowercased kind plus `s`.
fn api_resource(resource: &ResourceRef) -> ApiResource {
    let (group, version) = resource.group_version();
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &resource.kind))
}

fn manifest_ref(doc: &Value) -> Result<ResourceRef> {
    ResourceRef::from_manifest(doc).ok_or_else(|| {
        Error::provisioning(
            "apply manifest",
            "document is missing apiVersion, kind or metadata.name",
        )
    })
}

async fn apply_one(
    client: Client,
    ar: &ApiResource,
    namespace: Option<&str>,
    resource: &ResourceRef,
    doc: &Value,
) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    KubeCluster::api(client, ar, namespace)
        .patch(&resource.name, &params, &Patch::Apply(doc))
        .await
        .or_provisioning(|| format!("apply {resource}"))?;
    trace!(%resource, "applied");
    Ok(())
}

async fn list_all(api: Api<DynamicObject>, ar: &ApiResource) -> Result<Vec<Value>> {
    let list = api
        .list(&ListParams::default())
        .await
        .or_provisioning(|| format!("list {}", ar.kind))?;
    list.items
        .into_iter()
        .map(|obj| to_value(obj, ar))
        .collect()
}

/// List items omit their type; restore it so callers can tell kinds apart.
fn to_value(mut obj: DynamicObject, ar: &ApiResource) -> Result<Value> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    serde_json::to_value(obj).or_provisioning(|| format!("decode {}", ar.kind))
}
