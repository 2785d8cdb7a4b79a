#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod authz;
mod certs;
mod cleanup;
mod infra;
mod mesh;
mod pipeline;
mod policy;
mod prereq;
mod routing;
mod smoke;
mod tools;
mod wait;
mod workload;

pub use self::{
    args::{Args, Completion},
    authz::AuthzCheck,
    mesh::Endpoint,
    pipeline::{provision, Outcome, Stage, Summary},
    policy::AddonHealth,
    smoke::{HttpProbe, SmokeResult},
    tools::CliToolchain,
};
