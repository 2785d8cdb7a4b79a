//! Gateway API routing for the sample application.
//!
//! The Gateway, its HTTPRoute and the ReferenceGrant that lets the route cross into the
//! application namespace only work together, so they are rendered as one manifest.

use crate::{injected_namespace, Manifest, ObjectMeta};
use mesh_provisioner_core::{Result, RunConfig};
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "gateway.networking.k8s.io";
pub const API_VERSION: &str = "gateway.networking.k8s.io/v1";
pub const REFERENCE_GRANT_API_VERSION: &str = "gateway.networking.k8s.io/v1beta1";

const GATEWAY_NAME: &str = "istio";
const ROUTE_NAME: &str = "bookinfo";
const GRANT_NAME: &str = "allow-istio-system";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: GatewaySpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub gateway_class_name: String,
    pub addresses: Vec<GatewayAddress>,
    pub listeners: Vec<Listener>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayAddress {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<ListenerTls>,
    pub allowed_routes: AllowedRoutes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTls {
    pub mode: String,
    pub certificate_refs: Vec<SecretObjectRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecretObjectRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllowedRoutes {
    pub namespaces: RouteNamespaces,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteNamespaces {
    pub from: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: HttpRouteSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    pub parent_refs: Vec<ParentRef>,
    pub rules: Vec<HttpRouteRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteRule {
    pub matches: Vec<HttpRouteMatch>,
    pub backend_refs: Vec<BackendRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpRouteMatch {
    pub path: PathMatch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathMatch {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendRef {
    pub name: String,
    pub namespace: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceGrant {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ReferenceGrantSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceGrantSpec {
    pub from: Vec<ReferenceGrantFrom>,
    pub to: Vec<ReferenceGrantTo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceGrantFrom {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceGrantTo {
    pub group: String,
    pub kind: String,
    pub name: String,
}

/// Paths of the sample application exposed through the gateway.
const ROUTES: [(&str, &str); 5] = [
    ("Exact", "/productpage"),
    ("PathPrefix", "/static"),
    ("Exact", "/login"),
    ("Exact", "/logout"),
    ("PathPrefix", "/api/v1/products"),
];

pub fn gateway(config: &RunConfig, fqdn: &str) -> Gateway {
    let mesh = &config.mesh;
    let all_namespaces = || AllowedRoutes {
        namespaces: RouteNamespaces {
            from: "All".to_string(),
        },
    };
    Gateway {
        api_version: API_VERSION.to_string(),
        kind: "Gateway".to_string(),
        metadata: ObjectMeta {
            name: Some(GATEWAY_NAME.to_string()),
            namespace: Some(mesh.namespace.clone()),
            ..Default::default()
        },
        spec: GatewaySpec {
            gateway_class_name: "istio".to_string(),
            // Bind to the ingress gateway installed by the mesh profile rather than
            // provisioning a new one.
            addresses: vec![GatewayAddress {
                type_: "Hostname".to_string(),
                value: format!("{}.{}.svc.cluster.local", mesh.ingress, mesh.namespace),
            }],
            listeners: vec![
                Listener {
                    name: "http".to_string(),
                    hostname: None,
                    port: 80,
                    protocol: "HTTP".to_string(),
                    tls: None,
                    allowed_routes: all_namespaces(),
                },
                Listener {
                    name: "https".to_string(),
                    hostname: Some(fqdn.to_string()),
                    port: 443,
                    protocol: "HTTPS".to_string(),
                    tls: Some(ListenerTls {
                        mode: "Terminate".to_string(),
                        certificate_refs: vec![SecretObjectRef {
                            kind: "Secret".to_string(),
                            name: config.cert_manager.certificate_name.clone(),
                            namespace: mesh.namespace.clone(),
                        }],
                    }),
                    allowed_routes: all_namespaces(),
                },
            ],
        },
    }
}

pub fn http_route(config: &RunConfig) -> HttpRoute {
    let workload = &config.workload;
    HttpRoute {
        api_version: API_VERSION.to_string(),
        kind: "HTTPRoute".to_string(),
        metadata: ObjectMeta {
            name: Some(ROUTE_NAME.to_string()),
            namespace: Some(config.mesh.namespace.clone()),
            ..Default::default()
        },
        spec: HttpRouteSpec {
            parent_refs: vec![ParentRef {
                name: GATEWAY_NAME.to_string(),
                namespace: config.mesh.namespace.clone(),
            }],
            rules: vec![HttpRouteRule {
                matches: ROUTES
                    .iter()
                    .map(|(type_, value)| HttpRouteMatch {
                        path: PathMatch {
                            type_: type_.to_string(),
                            value: value.to_string(),
                        },
                    })
                    .collect(),
                backend_refs: vec![BackendRef {
                    name: workload.frontend.clone(),
                    namespace: workload.namespace.clone(),
                    port: workload.service_port,
                }],
            }],
        },
    }
}

/// Allows routes in the mesh namespace to target the front-end service.
pub fn reference_grant(config: &RunConfig) -> ReferenceGrant {
    ReferenceGrant {
        api_version: REFERENCE_GRANT_API_VERSION.to_string(),
        kind: "ReferenceGrant".to_string(),
        metadata: ObjectMeta {
            name: Some(GRANT_NAME.to_string()),
            namespace: Some(config.workload.namespace.clone()),
            ..Default::default()
        },
        spec: ReferenceGrantSpec {
            from: vec![ReferenceGrantFrom {
                group: GROUP.to_string(),
                kind: "HTTPRoute".to_string(),
                namespace: config.mesh.namespace.clone(),
            }],
            to: vec![ReferenceGrantTo {
                group: String::new(),
                kind: "Service".to_string(),
                name: config.workload.frontend.clone(),
            }],
        },
    }
}

/// The application namespace followed by the Gateway, HTTPRoute and ReferenceGrant.
pub fn routing_manifest(config: &RunConfig, fqdn: &str) -> Result<Manifest> {
    Manifest::default()
        .with(&injected_namespace(&config.workload.namespace))?
        .with(&gateway(config, fqdn))?
        .with(&http_route(config))?
        .with(&reference_grant(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_api::apis::standard::{
        gateways::Gateway as UpstreamGateway, httproutes::HTTPRoute as UpstreamHttpRoute,
        referencegrants::ReferenceGrant as UpstreamReferenceGrant,
    };

    const FQDN: &str = "abc12.eastus.cloudapp.azure.com";

    fn config() -> RunConfig {
        RunConfig::new("abc12".parse().unwrap())
    }

    #[test]
    fn manifest_order() {
        let manifest = routing_manifest(&config(), FQDN).unwrap();
        let kinds = manifest
            .resources()
            .into_iter()
            .map(|r| r.kind)
            .collect::<Vec<_>>();
        assert_eq!(kinds, ["Namespace", "Gateway", "HTTPRoute", "ReferenceGrant"]);
    }

    #[test]
    fn gateway_matches_upstream_schema() {
        let manifest = routing_manifest(&config(), FQDN).unwrap();
        let doc = manifest.find("Gateway", "istio").unwrap();
        let gw: UpstreamGateway = serde_json::from_value(doc.clone()).unwrap();

        assert_eq!(gw.spec.gateway_class_name, "istio");
        assert_eq!(gw.spec.listeners.len(), 2);
        let https = gw
            .spec
            .listeners
            .iter()
            .find(|l| l.name == "https")
            .unwrap();
        assert_eq!(https.port, 443);
        assert_eq!(https.hostname.as_deref(), Some(FQDN));
        let tls = https.tls.as_ref().unwrap();
        let cert = &tls.certificate_refs.as_ref().unwrap()[0];
        assert_eq!(cert.name, "istio-ingressgateway-certs");
        assert_eq!(cert.namespace.as_deref(), Some("istio-system"));
    }

    #[test]
    fn route_matches_upstream_schema() {
        let manifest = routing_manifest(&config(), FQDN).unwrap();
        let doc = manifest.find("HTTPRoute", "bookinfo").unwrap();
        let route: UpstreamHttpRoute = serde_json::from_value(doc.clone()).unwrap();

        let parents = route.spec.parent_refs.unwrap();
        assert_eq!(parents[0].name, "istio");
        assert_eq!(parents[0].namespace.as_deref(), Some("istio-system"));

        let rules = route.spec.rules.unwrap();
        assert_eq!(rules[0].matches.as_ref().unwrap().len(), 5);
        let backend = &rules[0].backend_refs.as_ref().unwrap()[0];
        assert_eq!(backend.name, "productpage");
        assert_eq!(backend.namespace.as_deref(), Some("sample-app"));
        assert_eq!(backend.port, Some(9080));

        let paths = doc["spec"]["rules"][0]["matches"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| {
                (
                    m["path"]["type"].as_str().unwrap(),
                    m["path"]["value"].as_str().unwrap(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(paths, ROUTES);
    }

    #[test]
    fn grant_matches_upstream_schema() {
        let manifest = routing_manifest(&config(), FQDN).unwrap();
        let doc = manifest.find("ReferenceGrant", "allow-istio-system").unwrap();
        assert_eq!(doc["apiVersion"], "gateway.networking.k8s.io/v1beta1");
        assert_eq!(doc["metadata"]["namespace"], "sample-app");

        let grant: UpstreamReferenceGrant = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(grant.spec.from[0].kind, "HTTPRoute");
        assert_eq!(grant.spec.from[0].namespace, "istio-system");
        assert_eq!(grant.spec.to[0].kind, "Service");
        assert_eq!(grant.spec.to[0].group, "");
        assert_eq!(grant.spec.to[0].name.as_deref(), Some("productpage"));
    }
}
