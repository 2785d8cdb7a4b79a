use crate::Result;
use serde_json::Value;
use std::fmt;

/// The Kubernetes API of the provisioned cluster.
///
/// Objects cross this boundary as JSON so that custom resources (cert-manager, Gateway API,
/// Istio, Gatekeeper) are handled the same way as built-in kinds. Readiness predicates in the
/// manifest crate interpret the returned documents.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Fetches an object, returning `None` if it does not exist.
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>>;

    /// Lists objects of a kind, across all namespaces when `namespace` is `None`.
    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>)
        -> Result<Vec<Value>>;

    /// Lists every object of every kind served by an API group.
    async fn list_group(&self, group: &str) -> Result<Vec<Value>>;

    /// Server-side applies a multi-document YAML manifest. Namespaced objects without a
    /// namespace are placed in `default_namespace`.
    async fn apply(&self, manifest: &str, default_namespace: Option<&str>)
        -> Result<Vec<ResourceRef>>;

    /// Downloads a manifest bundle and applies it.
    async fn apply_url(&self, url: &str, default_namespace: Option<&str>)
        -> Result<Vec<ResourceRef>>;

    /// Applies a JSON merge patch to an existing object.
    async fn merge_patch(&self, resource: &ResourceRef, patch: &Value) -> Result<()>;

    async fn exists(&self, resource: &ResourceRef) -> Result<bool> {
        Ok(self.get(resource).await?.is_some())
    }
}

/// Names a Kubernetes object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

// === impl ResourceRef ===

impl ResourceRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.map(Into::into),
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::new("v1", "Namespace", None, name)
    }

    pub fn deployment(namespace: &str, name: impl Into<String>) -> Self {
        Self::new("apps/v1", "Deployment", Some(namespace), name)
    }

    pub fn service(namespace: &str, name: impl Into<String>) -> Self {
        Self::new("v1", "Service", Some(namespace), name)
    }

    pub fn secret(namespace: &str, name: impl Into<String>) -> Self {
        Self::new("v1", "Secret", Some(namespace), name)
    }

    pub fn config_map(namespace: &str, name: impl Into<String>) -> Self {
        Self::new("v1", "ConfigMap", Some(namespace), name)
    }

    /// Reads the identifying fields of a manifest document.
    pub fn from_manifest(doc: &Value) -> Option<Self> {
        Some(Self {
            api_version: doc.get("apiVersion")?.as_str()?.to_string(),
            kind: doc.get("kind")?.as_str()?.to_string(),
            name: doc.pointer("/metadata/name")?.as_str()?.to_string(),
            namespace: doc
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    /// Splits `apiVersion` into its group and version; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        self.api_version
            .split_once('/')
            .unwrap_or(("", self.api_version.as_str()))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}
