use crate::Deployment;
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;

pub const CONDITION_READY: &str = "Ready";
const STATUS_TRUE: &str = "True";

/// A deployment is ready once at least its desired number of replicas report ready.
pub fn deployment_ready(obj: &Value) -> bool {
    let Ok(deploy) = Deployment::deserialize(obj) else {
        return false;
    };
    let desired = deploy.spec.and_then(|s| s.replicas).unwrap_or(1);
    let ready = deploy.status.and_then(|s| s.ready_replicas).unwrap_or(0);
    ready >= desired
}

/// Checks `status.conditions` for a condition of the given type with status `True`.
///
/// Works for nodes as well as cert-manager issuers and certificates.
pub fn has_condition(obj: &Value, condition_type: &str) -> bool {
    obj.pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(condition_type)
                    && c.get("status").and_then(Value::as_str) == Some(STATUS_TRUE)
            })
        })
        .unwrap_or(false)
}

pub fn node_ready(obj: &Value) -> bool {
    has_condition(obj, CONDITION_READY)
}

/// True once a pod has been scheduled and all of its containers have started.
pub fn pod_running(obj: &Value) -> bool {
    obj.pointer("/status/phase").and_then(Value::as_str) == Some("Running")
}

pub fn has_label(obj: &Value, key: &str, value: &str) -> bool {
    obj.pointer("/metadata/labels")
        .and_then(|labels| labels.get(key))
        .and_then(Value::as_str)
        == Some(value)
}

/// The first external address assigned to a `LoadBalancer` service.
pub fn load_balancer_ip(obj: &Value) -> Option<IpAddr> {
    obj.pointer("/status/loadBalancer/ingress")?
        .as_array()?
        .iter()
        .find_map(|ingress| ingress.get("ip")?.as_str()?.parse().ok())
}
