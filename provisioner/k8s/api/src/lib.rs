#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Manifests rendered from a [`RunConfig`] and predicates that interpret the objects read
//! back from the cluster.

pub mod authz;
pub mod cert_manager;
pub mod gatekeeper;
pub mod gateway;
mod manifest;
pub mod readiness;

pub use self::manifest::{parse_documents, Manifest};
pub use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Namespace, Node, Pod, Secret, Service},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use maplit::{btreemap, convert_args};
use mesh_provisioner_core::{Result, RunConfig};

/// Label that opts a namespace into sidecar injection.
pub const INJECTION_LABEL: &str = "istio-injection";

/// A namespace whose pods receive mesh sidecars.
///
/// Every manifest that declares a namespace uses this form so that re-applying one manifest
/// never drops the injection label set by another.
pub fn injected_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(convert_args!(btreemap!(
                INJECTION_LABEL => "enabled",
            ))),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The sample application's namespace.
pub fn workload_namespace(config: &RunConfig) -> Result<Manifest> {
    Manifest::default().with(&injected_namespace(&config.workload.namespace))
}
