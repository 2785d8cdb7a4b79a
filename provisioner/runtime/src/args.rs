use crate::{cleanup, pipeline, tools::CliToolchain, HttpProbe, Summary};
use anyhow::Result;
use clap::Parser;
use mesh_provisioner_azure::AzCli;
use mesh_provisioner_core::{
    poll::{parse_duration, Schedule},
    IssuerMode, Platform, PolicyConfig, PolicyEffect, RunConfig, RunId,
};
use mesh_provisioner_k8s_client::KubeCluster;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Provisions an AKS cluster running Istio with a TLS-terminated Gateway API ingress and a
/// sample application.
///
/// Every resource name is derived from RUN_ID. Re-running with the same id skips whatever
/// already exists and resumes where a previous run stopped.
#[derive(Debug, Parser)]
#[clap(name = "mesh-provisioner", version, about)]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh_provisioner=info,warn",
        env = "MESH_PROVISIONER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "MESH_PROVISIONER_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    run: RunArgs,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Five lowercase letters or digits. A random id is generated when omitted.
    run_id: Option<String>,

    #[clap(long, env = "MESH_PROVISIONER_LOCATION", default_value = "eastus")]
    location: String,

    /// Let's Encrypt environment: staging or production.
    #[clap(long, env = "MESH_PROVISIONER_ISSUER", default_value = "production")]
    issuer: IssuerMode,

    #[clap(long, default_value = "1.31.6")]
    kubernetes_version: String,

    #[clap(long, default_value = "1")]
    node_count: u16,

    #[clap(long, default_value = "1.24.4")]
    mesh_version: String,

    /// Namespace of the sample application.
    #[clap(long, default_value = "sample-app")]
    app_namespace: String,

    /// Skips the OPA external authorization server.
    #[clap(long)]
    no_opa: bool,

    /// Skips the admission policy assignment and compliance report.
    #[clap(long)]
    no_azure_policy: bool,

    /// Admission policy effect: audit or deny.
    #[clap(long, default_value = "audit")]
    policy_effect: PolicyEffect,

    /// Waits for the admission policy to reach the cluster instead of returning immediately.
    #[clap(long)]
    await_policy: bool,

    #[clap(long, default_value = "30x5s")]
    resource_poll: Schedule,

    #[clap(long, default_value = "30x10s")]
    cluster_poll: Schedule,

    #[clap(long, default_value = "30x10s")]
    address_poll: Schedule,

    #[clap(long, default_value = "30x10s")]
    certificate_poll: Schedule,

    #[clap(long, default_value = "90x10s")]
    policy_poll: Schedule,

    #[clap(long, default_value = "30s", value_parser = parse_duration)]
    cluster_settle: Duration,

    #[clap(long, default_value = "60s", value_parser = parse_duration)]
    load_balancer_settle: Duration,

    #[clap(long, default_value = "60s", value_parser = parse_duration)]
    workload_settle: Duration,

    /// Deletes the resource group of RUN_ID instead of provisioning.
    #[clap(long, requires = "run_id")]
    cleanup: bool,

    /// Does not ask for confirmation before deleting.
    #[clap(long, short = 'y')]
    yes: bool,
}

/// How a successful invocation ended.
#[derive(Debug)]
pub enum Completion {
    Provisioned(Box<Summary>),
    Deleted,
    NothingToDelete,
    Cancelled,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            run,
        } = self;
        log_format.try_init(log_level)?;

        let http = reqwest::Client::builder().build()?;
        let platform = Platform {
            cloud: Arc::new(AzCli::default()),
            cluster: Arc::new(KubeCluster::new(http)),
            tools: Arc::new(CliToolchain::default()),
            probe: Arc::new(HttpProbe::new()?),
        };

        match run.execute(&platform).await? {
            Completion::Provisioned(summary) => {
                info!(run_id = %summary.config.run_id, "done");
            }
            Completion::Deleted | Completion::NothingToDelete | Completion::Cancelled => {}
        }
        Ok(())
    }

    /// Runs the requested operation against `platform`.
    pub async fn execute(&self, platform: &Platform) -> Result<Completion> {
        self.run.execute(platform).await
    }

    /// Validates the arguments into a [`RunConfig`] without touching any external system.
    pub fn run_config(&self) -> Result<RunConfig> {
        self.run.run_config()
    }
}

// === impl RunArgs ===

impl RunArgs {
    async fn execute(&self, platform: &Platform) -> Result<Completion> {
        let config = self.run_config()?;
        if self.cleanup {
            return Ok(cleanup::run(&config, platform, self.yes).await?);
        }
        let summary = pipeline::provision(&config, platform).await?;
        Ok(Completion::Provisioned(Box::new(summary)))
    }

    fn run_config(&self) -> Result<RunConfig> {
        let run_id = match &self.run_id {
            Some(id) => id.parse::<RunId>()?,
            None => {
                let id = RunId::generate();
                info!(run_id = %id, "generated run id");
                id
            }
        };

        let mut config = RunConfig::new(run_id);
        config.location = self.location.clone();
        config.kubernetes_version = self.kubernetes_version.clone();
        config.node_count = self.node_count;
        config.mesh.version = self.mesh_version.clone();
        config.workload.namespace = self.app_namespace.clone();
        config.cert_manager.issuer_mode = self.issuer;
        if self.no_opa {
            config.authz = None;
        }
        config.policy = (!self.no_azure_policy).then(|| PolicyConfig {
            effect: self.policy_effect,
            await_propagation: self.await_policy,
            ..PolicyConfig::default()
        });

        let timeouts = &mut config.timeouts;
        timeouts.resource = self.resource_poll;
        timeouts.cluster = self.cluster_poll;
        timeouts.address = self.address_poll;
        timeouts.certificate = self.certificate_poll;
        timeouts.policy = self.policy_poll;
        timeouts.cluster_settle = self.cluster_settle;
        timeouts.load_balancer_settle = self.load_balancer_settle;
        timeouts.workload_settle = self.workload_settle;

        Ok(config)
    }
}
