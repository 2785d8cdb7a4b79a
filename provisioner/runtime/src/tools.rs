use mesh_provisioner_core::{exec::Exec, Result, Tool, Toolchain};
use parking_lot::Mutex;
use std::{collections::HashMap, path::PathBuf};
use tracing::debug;

const ISTIO_DOWNLOAD: &str = "https://istio.io/downloadIstio";
const HELM_INSTALL: &str =
    "https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3";

/// Runs tools found on `PATH`, or installed into the working directory during the run.
#[derive(Debug, Default)]
pub struct CliToolchain {
    installed: Mutex<HashMap<Tool, PathBuf>>,
}

// === impl CliToolchain ===

impl CliToolchain {
    fn installed(&self, tool: Tool) -> Option<PathBuf> {
        self.installed.lock().get(&tool).cloned()
    }

    fn exec(&self, tool: Tool) -> Exec {
        match self.installed(tool) {
            Some(path) => Exec::new(path),
            None => Exec::new(tool.command()),
        }
    }

    fn install_script(tool: Tool, version: &str) -> Option<String> {
        match tool {
            Tool::Istioctl => Some(format!(
                "curl -sL {ISTIO_DOWNLOAD} | ISTIO_VERSION={version} sh -"
            )),
            Tool::Helm => Some(format!("curl -fsSL {HELM_INSTALL} | bash")),
            Tool::Az | Tool::Kubectl => None,
        }
    }
}

#[async_trait::async_trait]
impl Toolchain for CliToolchain {
    async fn is_available(&self, tool: Tool) -> Result<bool> {
        if let Some(path) = self.installed(tool) {
            return Ok(path.is_file());
        }
        let out = Exec::new("sh")
            .arg("-c")
            .arg(format!("command -v {}", tool.command()))
            .output()
            .await?;
        debug!(%tool, found = out.success, path = %out.stdout.trim());
        Ok(out.success)
    }

    async fn version(&self, tool: Tool) -> Option<String> {
        let out = self
            .exec(tool)
            .args(tool.version_args().iter().copied())
            .output()
            .await
            .ok()?;
        if !out.success {
            return None;
        }
        out.stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from)
    }

    async fn install(&self, tool: Tool, version: &str) -> Result<()> {
        let Some(script) = Self::install_script(tool, version) else {
            return Ok(());
        };
        Exec::new("sh").arg("-c").arg(script).run().await?;

        // The Istio download is unpacked into the working directory rather than onto PATH.
        if tool == Tool::Istioctl {
            let path = PathBuf::from(format!("istio-{version}"))
                .join("bin")
                .join(tool.command());
            debug!(%tool, path = %path.display(), "installed");
            self.installed.lock().insert(tool, path);
        }
        Ok(())
    }

    async fn run(&self, tool: Tool, args: &[String]) -> Result<String> {
        self.exec(tool).args(args.iter().cloned()).run().await
    }
}
