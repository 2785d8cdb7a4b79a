use mesh_provisioner_core::{Account, Error, Platform, Result, RunConfig, Tool};
use tracing::{info, warn};

/// Verifies every external tool and the cloud session before anything is created.
pub(crate) async fn check(config: &RunConfig, platform: &Platform) -> Result<Account> {
    for tool in Tool::ALL {
        ensure_tool(tool, config, platform).await?;
    }

    let account = platform.cloud.account().await?;
    info!(
        subscription = %account.subscription_name,
        subscription_id = %account.subscription_id,
        user = %account.user,
        "signed in"
    );
    Ok(account)
}

async fn ensure_tool(tool: Tool, config: &RunConfig, platform: &Platform) -> Result<()> {
    let tools = &platform.tools;
    if !tools.is_available(tool).await? {
        if !tool.auto_installable() {
            return Err(missing(tool));
        }

        let version = match tool {
            Tool::Istioctl => config.mesh.version.as_str(),
            _ => "latest",
        };
        info!(%tool, %version, "not found; installing");
        if let Err(error) = tools.install(tool, version).await {
            warn!(%tool, %error, "installation failed");
        }
        if !tools.is_available(tool).await? {
            return Err(missing(tool));
        }
    }

    match tools.version(tool).await {
        Some(version) => info!(%tool, %version, "found"),
        None => info!(%tool, "found"),
    }
    Ok(())
}

fn missing(tool: Tool) -> Error {
    Error::MissingTool {
        tool: tool.command(),
        hint: tool.install_hint(),
    }
}
