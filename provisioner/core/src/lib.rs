#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cloud;
pub mod cluster;
mod config;
mod error;
pub mod exec;
pub mod poll;
mod tools;

pub use self::{
    cloud::{Account, Cloud, ClusterSpec, PolicyAssignment, PublicIp},
    cluster::{Cluster, ResourceRef},
    config::{
        AuthzConfig, CertManagerConfig, IssuerMode, MeshConfig, PolicyConfig, PolicyEffect,
        RunConfig, RunId, Timeouts, WorkloadConfig, NAME_PREFIX,
    },
    error::{Error, ProvisioningExt, Result, TimedOut},
    poll::Schedule,
    tools::{Probe, Tool, Toolchain},
};
use std::sync::Arc;

/// Handles to every external system a run talks to.
#[derive(Clone)]
pub struct Platform {
    pub cloud: Arc<dyn Cloud>,
    pub cluster: Arc<dyn Cluster>,
    pub tools: Arc<dyn Toolchain>,
    pub probe: Arc<dyn Probe>,
}
