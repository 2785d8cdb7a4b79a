use crate::Result;
use std::fmt;

/// Command line tools a run depends on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tool {
    Az,
    Kubectl,
    Istioctl,
    Helm,
}

/// Locates, installs and runs the external tools.
#[async_trait::async_trait]
pub trait Toolchain: Send + Sync {
    /// True if the tool can be invoked.
    async fn is_available(&self, tool: Tool) -> Result<bool>;

    /// A one-line version string, for logging.
    async fn version(&self, tool: Tool) -> Option<String>;

    /// Best-effort installation of an auto-installable tool.
    async fn install(&self, tool: Tool, version: &str) -> Result<()>;

    /// Runs the tool with `args`, returning its stdout.
    async fn run(&self, tool: Tool, args: &[String]) -> Result<String>;
}

/// Issues plain HTTP(S) requests for smoke tests.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    /// Returns the response status code.
    async fn get(&self, url: &str) -> Result<u16>;
}

// === impl Tool ===

impl Tool {
    pub const ALL: [Tool; 4] = [Tool::Az, Tool::Kubectl, Tool::Istioctl, Tool::Helm];

    pub fn command(&self) -> &'static str {
        match self {
            Self::Az => "az",
            Self::Kubectl => "kubectl",
            Self::Istioctl => "istioctl",
            Self::Helm => "helm",
        }
    }

    /// Tools that are installed on demand rather than required up front.
    pub fn auto_installable(&self) -> bool {
        matches!(self, Self::Istioctl | Self::Helm)
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Self::Az => "install the Azure CLI: https://learn.microsoft.com/cli/azure/install-azure-cli",
            Self::Kubectl => "install kubectl: https://kubernetes.io/docs/tasks/tools/",
            Self::Istioctl => "install istioctl: https://istio.io/latest/docs/setup/getting-started/#download",
            Self::Helm => "install Helm: https://helm.sh/docs/intro/install/",
        }
    }

    pub fn version_args(&self) -> &'static [&'static str] {
        match self {
            Self::Az => &["version", "--output", "tsv", "--query", "\"azure-cli\""],
            Self::Kubectl => &["version", "--client"],
            Self::Istioctl => &["version", "--remote=false"],
            Self::Helm => &["version", "--short"],
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}
