use mesh_provisioner_core::{Error, Platform, Probe, Result};
use std::time::Duration;
use tracing::{info, warn};

const PATH: &str = "/productpage";
const TIMEOUT: Duration = Duration::from_secs(10);

/// The result of one smoke request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmokeResult {
    pub url: String,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// A [`Probe`] backed by `reqwest`.
///
/// Certificate verification is disabled: staging certificates are not publicly trusted, and
/// the production certificate may still be pending when the run finishes.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
}

// === impl HttpProbe ===

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| Error::provisioning("build HTTP client", e))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Probe for HttpProbe {
    async fn get(&self, url: &str) -> Result<u16> {
        let rsp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::provisioning(format!("GET {url}"), e))?;
        Ok(rsp.status().as_u16())
    }
}

/// Requests the application over plain HTTP and over TLS, recording whatever happens.
pub(crate) async fn run(platform: &Platform, fqdn: &str) -> Vec<SmokeResult> {
    let mut results = Vec::with_capacity(2);
    for scheme in ["http", "https"] {
        let url = format!("{scheme}://{fqdn}{PATH}");
        let result = match platform.probe.get(&url).await {
            Ok(status) => {
                info!(%url, status, "smoke test");
                SmokeResult {
                    url,
                    status: Some(status),
                    error: None,
                }
            }
            Err(error) => {
                warn!(%url, %error, "smoke test failed");
                SmokeResult {
                    url,
                    status: None,
                    error: Some(error.to_string()),
                }
            }
        };
        results.push(result);
    }
    results
}
