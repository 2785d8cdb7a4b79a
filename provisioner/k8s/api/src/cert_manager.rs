use crate::{Manifest, ObjectMeta};
use mesh_provisioner_core::{ResourceRef, Result, RunConfig};
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "cert-manager.io/v1";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIssuer {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ClusterIssuerSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterIssuerSpec {
    pub acme: AcmeIssuer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuer {
    pub server: String,
    pub email: String,
    pub private_key_secret_ref: SecretRef,
    pub solvers: Vec<AcmeSolver>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcmeSolver {
    pub http01: Http01Solver,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Http01Solver {
    pub ingress: Http01Ingress,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Http01Ingress {
    pub class: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CertificateSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    pub duration: String,
    pub renew_before: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub issuer_ref: IssuerRef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub organizations: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
    pub group: String,
}

/// An ACME issuer that answers HTTP-01 challenges through the mesh ingress.
pub fn cluster_issuer(config: &RunConfig, fqdn: &str) -> ClusterIssuer {
    let mode = config.cert_manager.issuer_mode;
    let name = mode.issuer_name();
    ClusterIssuer {
        api_version: API_VERSION.to_string(),
        kind: "ClusterIssuer".to_string(),
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        spec: ClusterIssuerSpec {
            acme: AcmeIssuer {
                server: mode.acme_server().to_string(),
                email: format!("admin@{fqdn}"),
                private_key_secret_ref: SecretRef { name },
                solvers: vec![AcmeSolver {
                    http01: Http01Solver {
                        ingress: Http01Ingress {
                            class: "istio".to_string(),
                        },
                    },
                }],
            },
        },
    }
}

/// The ingress gateway's serving certificate. cert-manager writes it to a secret of the
/// same name in the mesh namespace.
pub fn certificate(config: &RunConfig, fqdn: &str) -> Certificate {
    let cm = &config.cert_manager;
    Certificate {
        api_version: API_VERSION.to_string(),
        kind: "Certificate".to_string(),
        metadata: ObjectMeta {
            name: Some(cm.certificate_name.clone()),
            namespace: Some(config.mesh.namespace.clone()),
            ..Default::default()
        },
        spec: CertificateSpec {
            secret_name: cm.certificate_name.clone(),
            duration: cm.certificate_duration.clone(),
            renew_before: cm.certificate_renew_before.clone(),
            subject: Some(Subject {
                organizations: vec!["Example Organization".to_string()],
            }),
            common_name: fqdn.to_string(),
            dns_names: vec![fqdn.to_string()],
            issuer_ref: IssuerRef {
                name: config.issuer_name(),
                kind: "ClusterIssuer".to_string(),
                group: "cert-manager.io".to_string(),
            },
        },
    }
}

pub fn issuer_manifest(config: &RunConfig, fqdn: &str) -> Result<Manifest> {
    Manifest::default().with(&cluster_issuer(config, fqdn))
}

pub fn certificate_manifest(config: &RunConfig, fqdn: &str) -> Result<Manifest> {
    Manifest::default().with(&certificate(config, fqdn))
}

pub fn issuer_ref(config: &RunConfig) -> ResourceRef {
    ResourceRef::new(API_VERSION, "ClusterIssuer", None, config.issuer_name())
}

pub fn certificate_ref(config: &RunConfig) -> ResourceRef {
    ResourceRef::new(
        API_VERSION,
        "Certificate",
        Some(&config.mesh.namespace),
        config.cert_manager.certificate_name.clone(),
    )
}

/// The secret cert-manager materializes once the certificate is issued.
pub fn certificate_secret_ref(config: &RunConfig) -> ResourceRef {
    ResourceRef::secret(
        &config.mesh.namespace,
        config.cert_manager.certificate_name.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_provisioner_core::IssuerMode;

    const FQDN: &str = "abc12.eastus.cloudapp.azure.com";

    fn config(mode: IssuerMode) -> RunConfig {
        let mut config = RunConfig::new("abc12".parse().unwrap());
        config.cert_manager.issuer_mode = mode;
        config
    }

    #[test]
    fn staging_issuer_uses_staging_server() {
        let yaml = issuer_manifest(&config(IssuerMode::Staging), FQDN)
            .unwrap()
            .to_yaml()
            .unwrap();
        let docs = crate::parse_documents(&yaml).unwrap();
        let issuer = &docs[0];
        assert_eq!(issuer["kind"], "ClusterIssuer");
        assert_eq!(issuer["metadata"]["name"], "letsencrypt-staging");
        assert_eq!(
            issuer["spec"]["acme"]["server"],
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(
            issuer["spec"]["acme"]["email"],
            "admin@abc12.eastus.cloudapp.azure.com"
        );
        assert_eq!(
            issuer["spec"]["acme"]["privateKeySecretRef"]["name"],
            "letsencrypt-staging"
        );
        assert_eq!(
            issuer["spec"]["acme"]["solvers"][0]["http01"]["ingress"]["class"],
            "istio"
        );
    }

    #[test]
    fn production_issuer_uses_production_server() {
        let issuer = cluster_issuer(&config(IssuerMode::Production), FQDN);
        assert_eq!(
            issuer.spec.acme.server,
            "https://acme-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(issuer.metadata.name.as_deref(), Some("letsencrypt-production"));
    }

    #[test]
    fn certificate_references_issuer() {
        let config = config(IssuerMode::Staging);
        let yaml = certificate_manifest(&config, FQDN).unwrap().to_yaml().unwrap();
        let cert = &crate::parse_documents(&yaml).unwrap()[0];
        assert_eq!(cert["metadata"]["namespace"], "istio-system");
        assert_eq!(cert["spec"]["secretName"], "istio-ingressgateway-certs");
        assert_eq!(cert["spec"]["duration"], "2160h");
        assert_eq!(cert["spec"]["renewBefore"], "360h");
        assert_eq!(cert["spec"]["commonName"], FQDN);
        assert_eq!(cert["spec"]["dnsNames"][0], FQDN);
        assert_eq!(cert["spec"]["issuerRef"]["name"], "letsencrypt-staging");
        assert_eq!(cert["spec"]["issuerRef"]["kind"], "ClusterIssuer");

        assert_eq!(
            certificate_secret_ref(&config).to_string(),
            "Secret/istio-system/istio-ingressgateway-certs"
        );
        assert_eq!(issuer_ref(&config).to_string(), "ClusterIssuer/letsencrypt-staging");
    }
}
