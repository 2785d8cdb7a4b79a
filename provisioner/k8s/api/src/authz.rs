//! OPA external authorization for the mesh.

use crate::{injected_namespace, ConfigMap, Deployment, Manifest, ObjectMeta, Pod, Service};
use k8s_openapi::{
    api::{
        apps::v1::DeploymentSpec,
        core::v1::{
            ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec,
            PodTemplateSpec, Probe, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use maplit::{btreemap, convert_args};
use mesh_provisioner_core::{AuthzConfig, ResourceRef, Result, RunConfig};
use serde::{Deserialize, Serialize};

pub const AUTHZ_LABEL: &str = "opa-authz";
pub const POLICY_CONFIG_MAP: &str = "opa-policy";
/// Header the seeded policy accepts as proof of authorization.
pub const AUTHORIZED_HEADER: &str = "x-user-authorized: true";
pub const CLIENT_POD: &str = "opa-test-client";
pub const CLIENT_CONTAINER: &str = "curl";

const NAME: &str = "opa";
const AUTHORIZATION_POLICY: &str = "opa-external-authz";
const ISTIO_SECURITY_API_VERSION: &str = "security.istio.io/v1";
const CONFIG_MAP: &str = "opa-config";
const DIAGNOSTIC_PORT: i32 = 8282;
const CLIENT_IMAGE: &str = "curlimages/curl:latest";

/// The policy seeded on first install. Operators edit the ConfigMap afterwards; OPA runs
/// with `--watch` and reloads the mounted file when the kubelet syncs the change.
pub const SEED_POLICY: &str = r#"package authz

import rego.v1

default allow := false

# Allow requests that carry the authorization header
allow if {
    input.attributes.request.http.headers["x-user-authorized"] == "true"
}

# Anonymous GETs of the product page
allow if {
    input.attributes.request.http.method == "GET"
    startswith(input.attributes.request.http.path, "/productpage")
}

# Static assets
allow if {
    input.attributes.request.http.method == "GET"
    startswith(input.attributes.request.http.path, "/static")
}
"#;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicy {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: AuthorizationPolicySpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicySpec {
    pub selector: WorkloadSelector,
    pub action: String,
    pub provider: ExtensionProvider,
    pub rules: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    pub match_labels: std::collections::BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionProvider {
    pub name: String,
}

fn labels() -> std::collections::BTreeMap<String, String> {
    convert_args!(btreemap!("app" => NAME))
}

fn server_config(authz: &AuthzConfig) -> String {
    format!(
        "decision_logs:\n  console: true\nplugins:\n  envoy_ext_authz_grpc:\n    addr: \":{}\"\n    path: authz/allow\n",
        authz.grpc_port
    )
}

pub fn config_map(authz: &AuthzConfig) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP.to_string()),
            namespace: Some(authz.namespace.clone()),
            ..Default::default()
        },
        data: Some(btreemap! {
            "config.yaml".to_string() => server_config(authz),
        }),
        ..Default::default()
    }
}

pub fn policy_config_map(authz: &AuthzConfig) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(POLICY_CONFIG_MAP.to_string()),
            namespace: Some(authz.namespace.clone()),
            ..Default::default()
        },
        data: Some(btreemap! {
            "policy.rego".to_string() => SEED_POLICY.to_string(),
        }),
        ..Default::default()
    }
}

pub fn deployment(authz: &AuthzConfig) -> Deployment {
    let health_probe = |path: &str, initial_delay_seconds, period_seconds| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(DIAGNOSTIC_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        ..Default::default()
    };
    let config_volume = |name: &str| Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(authz.namespace.clone()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: NAME.to_string(),
                        image: Some(authz.image.clone()),
                        args: Some(
                            [
                                "run",
                                "--server",
                                "--disable-telemetry",
                                "--config-file=/config/config.yaml",
                                "--log-level=info",
                                "--diagnostic-addr=0.0.0.0:8282",
                                "--watch",
                                "/policy/policy.rego",
                            ]
                            .into_iter()
                            .map(String::from)
                            .collect(),
                        ),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("grpc".to_string()),
                                container_port: authz.grpc_port.into(),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some("diagnostic".to_string()),
                                container_port: DIAGNOSTIC_PORT,
                                ..Default::default()
                            },
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: CONFIG_MAP.to_string(),
                                mount_path: "/config".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: POLICY_CONFIG_MAP.to_string(),
                                mount_path: "/policy".to_string(),
                                ..Default::default()
                            },
                        ]),
                        liveness_probe: Some(health_probe("/health", 30, 10)),
                        readiness_probe: Some(health_probe("/health?bundle=true", 5, 5)),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        config_volume(CONFIG_MAP),
                        config_volume(POLICY_CONFIG_MAP),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service(authz: &AuthzConfig) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(authz.namespace.clone()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels()),
            ports: Some(vec![
                ServicePort {
                    name: Some("grpc".to_string()),
                    port: authz.grpc_port.into(),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("diagnostic".to_string()),
                    port: DIAGNOSTIC_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The OPA server and its configuration. The policy document is seeded separately so
/// that re-applying this manifest never replaces an edited policy.
pub fn server_manifest(authz: &AuthzConfig) -> Result<Manifest> {
    Manifest::default()
        .with(&injected_namespace(&authz.namespace))?
        .with(&config_map(authz))?
        .with(&deployment(authz))?
        .with(&service(authz))
}

pub fn policy_manifest(authz: &AuthzConfig) -> Result<Manifest> {
    Manifest::default().with(&policy_config_map(authz))
}

/// Routes requests for workloads labeled `opa-authz=enabled` through the OPA provider.
pub fn authorization_policy(config: &RunConfig, authz: &AuthzConfig) -> AuthorizationPolicy {
    AuthorizationPolicy {
        api_version: ISTIO_SECURITY_API_VERSION.to_string(),
        kind: "AuthorizationPolicy".to_string(),
        metadata: ObjectMeta {
            name: Some(AUTHORIZATION_POLICY.to_string()),
            namespace: Some(config.mesh.namespace.clone()),
            ..Default::default()
        },
        spec: AuthorizationPolicySpec {
            selector: WorkloadSelector {
                match_labels: convert_args!(btreemap!(AUTHZ_LABEL => "enabled")),
            },
            action: "CUSTOM".to_string(),
            provider: ExtensionProvider {
                name: authz.provider.clone(),
            },
            rules: vec![serde_json::json!({})],
        },
    }
}

pub fn authorization_manifest(config: &RunConfig, authz: &AuthzConfig) -> Result<Manifest> {
    Manifest::default().with(&authorization_policy(config, authz))
}

/// Merge patch that opts a deployment's pods into external authorization.
pub fn enable_authz_patch() -> serde_json::Value {
    let mut labels = serde_json::Map::new();
    labels.insert(AUTHZ_LABEL.to_string(), "enabled".into());
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": { "labels": labels }
            }
        }
    })
}

/// `istioctl` settings that register OPA as an extension provider.
pub fn mesh_settings(authz: &AuthzConfig) -> Vec<String> {
    vec![
        format!("meshConfig.extensionProviders[0].name={}", authz.provider),
        format!(
            "meshConfig.extensionProviders[0].envoyExtAuthzGrpc.service={}",
            authz.service_host()
        ),
        format!(
            "meshConfig.extensionProviders[0].envoyExtAuthzGrpc.port={}",
            authz.grpc_port
        ),
    ]
}

/// An idle curl pod in the sample namespace, used to send requests from inside the mesh.
pub fn client_pod(namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(CLIENT_POD.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(convert_args!(btreemap!("app" => CLIENT_POD))),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CLIENT_CONTAINER.to_string(),
                image: Some(CLIENT_IMAGE.to_string()),
                command: Some(vec!["/bin/sleep".to_string(), "3600".to_string()]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn client_manifest(namespace: &str) -> Result<Manifest> {
    Manifest::default().with(&client_pod(namespace))
}

pub fn client_pod_ref(namespace: &str) -> ResourceRef {
    ResourceRef::new("v1", "Pod", Some(namespace), CLIENT_POD)
}

pub fn deployment_ref(authz: &AuthzConfig) -> ResourceRef {
    ResourceRef::deployment(&authz.namespace, NAME)
}

pub fn policy_config_map_ref(authz: &AuthzConfig) -> ResourceRef {
    ResourceRef::config_map(&authz.namespace, POLICY_CONFIG_MAP)
}

pub fn authorization_policy_ref(config: &RunConfig) -> ResourceRef {
    ResourceRef::new(
        ISTIO_SECURITY_API_VERSION,
        "AuthorizationPolicy",
        Some(&config.mesh.namespace),
        AUTHORIZATION_POLICY,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_manifest_contents() {
        let authz = AuthzConfig::default();
        let manifest = server_manifest(&authz).unwrap();
        let kinds = manifest
            .resources()
            .into_iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [
                "Namespace/opa",
                "ConfigMap/opa/opa-config",
                "Deployment/opa/opa",
                "Service/opa/opa"
            ]
        );

        let deploy = manifest.find("Deployment", "opa").unwrap();
        let container = &deploy["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "openpolicyagent/opa:0.61.0-envoy");
        assert_eq!(container["ports"][0]["containerPort"], 9191);
        assert_eq!(
            container["readinessProbe"]["httpGet"]["path"],
            "/health?bundle=true"
        );
        let args = container["args"].as_array().unwrap();
        assert!(args.contains(&serde_json::json!("--watch")));
        assert_eq!(args.last().unwrap(), "/policy/policy.rego");

        let config = manifest.find("ConfigMap", "opa-config").unwrap();
        let server: serde_yaml::Value =
            serde_yaml::from_str(config["data"]["config.yaml"].as_str().unwrap()).unwrap();
        assert_eq!(server["plugins"]["envoy_ext_authz_grpc"]["addr"], ":9191");
        assert_eq!(server["plugins"]["envoy_ext_authz_grpc"]["path"], "authz/allow");

        // The policy document is never part of the server manifest.
        assert!(manifest.find("ConfigMap", POLICY_CONFIG_MAP).is_none());
    }

    #[test]
    fn authorization_policy_is_custom() {
        let config = RunConfig::new("abc12".parse().unwrap());
        let authz = AuthzConfig::default();
        let manifest = authorization_manifest(&config, &authz).unwrap();
        let policy = manifest
            .find("AuthorizationPolicy", "opa-external-authz")
            .unwrap();
        assert_eq!(policy["apiVersion"], "security.istio.io/v1");
        assert_eq!(policy["metadata"]["namespace"], "istio-system");
        assert_eq!(policy["spec"]["action"], "CUSTOM");
        assert_eq!(policy["spec"]["provider"]["name"], "opa.local");
        assert_eq!(policy["spec"]["selector"]["matchLabels"]["opa-authz"], "enabled");
        assert_eq!(policy["spec"]["rules"], serde_json::json!([{}]));
    }

    #[test]
    fn mesh_settings_point_at_service() {
        let settings = mesh_settings(&AuthzConfig::default());
        assert!(settings.contains(
            &"meshConfig.extensionProviders[0].envoyExtAuthzGrpc.service=opa.opa.svc.cluster.local"
                .to_string()
        ));
        assert!(settings
            .contains(&"meshConfig.extensionProviders[0].envoyExtAuthzGrpc.port=9191".to_string()));
    }

    #[test]
    fn client_pod_idles_in_namespace() {
        let manifest = client_manifest("sample-app").unwrap();
        assert_eq!(
            manifest.resources(),
            [client_pod_ref("sample-app")],
        );
        let pod = manifest.find("Pod", CLIENT_POD).unwrap();
        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["name"], CLIENT_CONTAINER);
        assert_eq!(container["image"], "curlimages/curl:latest");
        assert_eq!(container["command"], serde_json::json!(["/bin/sleep", "3600"]));
    }

    #[test]
    fn seed_policy_denies_by_default() {
        let manifest = policy_manifest(&AuthzConfig::default()).unwrap();
        let cm = manifest.find("ConfigMap", "opa-policy").unwrap();
        let rego = cm["data"]["policy.rego"].as_str().unwrap();
        assert!(rego.starts_with("package authz"));
        assert!(rego.contains("default allow := false"));
        let (name, value) = AUTHORIZED_HEADER.split_once(": ").unwrap();
        assert!(rego.contains(&format!("headers[\"{name}\"] == \"{value}\"")));
    }
}
