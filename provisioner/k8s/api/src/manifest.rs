use mesh_provisioner_core::{ProvisioningExt, ResourceRef, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An ordered set of objects that are applied together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    documents: Vec<Value>,
}

// === impl Manifest ===

impl Manifest {
    pub fn with<T: Serialize>(mut self, object: &T) -> Result<Self> {
        let doc = serde_json::to_value(object).or_provisioning(|| "render manifest".into())?;
        self.documents.push(doc);
        Ok(self)
    }

    pub fn documents(&self) -> &[Value] {
        &self.documents
    }

    pub fn resources(&self) -> Vec<ResourceRef> {
        self.documents
            .iter()
            .filter_map(ResourceRef::from_manifest)
            .collect()
    }

    pub fn find(&self, kind: &str, name: &str) -> Option<&Value> {
        self.documents.iter().find(|doc| {
            doc.get("kind").and_then(Value::as_str) == Some(kind)
                && doc.pointer("/metadata/name").and_then(Value::as_str) == Some(name)
        })
    }

    /// Renders a multi-document YAML stream.
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for doc in &self.documents {
            if !out.is_empty() {
                out.push_str("---\n");
            }
            out.push_str(&serde_yaml::to_string(doc).or_provisioning(|| "render manifest".into())?);
        }
        Ok(out)
    }
}

/// Splits a multi-document YAML stream, dropping empty documents.
pub fn parse_documents(yaml: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(yaml) {
        let doc = Value::deserialize(de).or_provisioning(|| "parse manifest".into())?;
        if !doc.is_null() {
            docs.push(doc);
        }
    }
    Ok(docs)
}
