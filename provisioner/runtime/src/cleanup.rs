use crate::Completion;
use mesh_provisioner_core::{Platform, ProvisioningExt, Result, RunConfig};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

/// Deletes the run's resource group, and with it the cluster and its node resources.
pub(crate) async fn run(
    config: &RunConfig,
    platform: &Platform,
    assume_yes: bool,
) -> Result<Completion> {
    let cloud = &platform.cloud;
    let account = cloud.account().await?;
    let rg = config.resource_group.as_str();

    if !cloud.resource_group_exists(rg).await? {
        info!(resource_group = %rg, "nothing to delete");
        return Ok(Completion::NothingToDelete);
    }

    if !assume_yes && !confirm(rg, &account.subscription_name).await? {
        info!(resource_group = %rg, "cancelled");
        return Ok(Completion::Cancelled);
    }

    info!(resource_group = %rg, "deleting; this takes several minutes");
    cloud.delete_resource_group(rg).await?;
    info!(resource_group = %rg, "deleted");
    Ok(Completion::Deleted)
}

async fn confirm(resource_group: &str, subscription: &str) -> Result<bool> {
    let prompt = format!(
        "Delete resource group {resource_group} in subscription {subscription:?} and everything in it? [y/N] "
    );
    let mut stdout = io::stdout();
    stdout
        .write_all(prompt.as_bytes())
        .await
        .or_provisioning(|| "prompt".into())?;
    stdout
        .flush()
        .await
        .or_provisioning(|| "prompt".into())?;

    let mut answer = String::new();
    BufReader::new(io::stdin())
        .read_line(&mut answer)
        .await
        .or_provisioning(|| "read confirmation".into())?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
