//! Startup error type composing the per-module errors.

use thiserror::Error;
use tokio::task::JoinError;

use crate::cert::CertError;
use crate::config::ConfigError;
use crate::rules::RuleError;
use crate::webhooks::{RegistrationError, WebhookError};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// Kubernetes client error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("invalid log filter: {0}")]
    LogFilter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background server task panicked or was cancelled
    #[error("{task} task aborted: {source}")]
    TaskAborted {
        task: &'static str,
        #[source]
        source: JoinError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Flatten the join result of a spawned server task.
pub fn task_result<E: Into<Error>>(
    task: &'static str,
    joined: std::result::Result<std::result::Result<(), E>, JoinError>,
) -> Result<()> {
    match joined {
        Ok(result) => result.map_err(Into::into),
        Err(source) => Err(Error::TaskAborted { task, source }),
    }
}
