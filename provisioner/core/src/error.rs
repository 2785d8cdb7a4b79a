use std::{net::IpAddr, time::Duration};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures that halt a provisioning run.
///
/// Input and prerequisite errors are raised before any mutating call is made. Everything
/// else leaves already-created resources in place so that a re-run with the same run id
/// resumes where this one stopped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid run id {value:?}: {reason}")]
    InvalidRunId { value: String, reason: &'static str },

    #[error("invalid {what} {value:?}: expected {expected}")]
    InvalidArgument {
        what: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{tool} is not installed; {hint}")]
    MissingTool {
        tool: &'static str,
        hint: &'static str,
    },

    #[error("no authenticated Azure session: {0}")]
    NotAuthenticated(String),

    #[error("{operation} failed: {message}")]
    Provisioning { operation: String, message: String },

    #[error(transparent)]
    TimedOut(#[from] TimedOut),

    #[error("no public IP in resource group {resource_group} has address {address}")]
    AddressNotFound {
        address: IpAddr,
        resource_group: String,
    },
}

/// A bounded poll ran out of attempts.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("timed out waiting for {what} after {attempts} attempts ({waited:?})")]
pub struct TimedOut {
    pub what: String,
    pub attempts: u32,
    pub waited: Duration,
}

// === impl Error ===

impl Error {
    pub fn provisioning(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Provisioning {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid(
        what: &'static str,
        value: impl Into<String>,
        expected: &'static str,
    ) -> Self {
        Self::InvalidArgument {
            what,
            value: value.into(),
            expected,
        }
    }
}

/// Attaches an operation name to foreign errors.
pub trait ProvisioningExt<T> {
    fn or_provisioning(self, operation: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E: std::fmt::Display> ProvisioningExt<T> for std::result::Result<T, E> {
    fn or_provisioning(self, operation: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::provisioning(operation(), e))
    }
}
