//! Injector configuration.
//!
//! Loaded from a YAML file. Every section and field is optional and falls
//! back to the defaults below; command-line flags are applied on top by the
//! binary.
//!
//! ```yaml
//! k8s:
//!   namespace: monitoring
//!   orgDomain: example.com
//! server:
//!   pathWebhook: /mutate
//! inject:
//!   - name: metrics
//!     containers:
//!       - name: node-exporter
//!         image: prom/node-exporter:v1.7.0
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rules::{InjectRule, RuleError, RuleRegistry};

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode config file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub inject: Vec<InjectRule>,

    #[serde(default)]
    pub k8s: K8sConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct K8sConfig {
    /// Namespace the injector's service lives in.
    pub namespace: String,
    pub service_name: String,
    pub service_port_number: u16,
    pub mutating_webhook_configuration_name: String,
    /// Suffix for webhook names and annotation keys.
    pub org_domain: String,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            service_name: crate::APP_NAME.to_string(),
            service_port_number: 8443,
            mutating_webhook_configuration_name: crate::APP_NAME.to_string(),
            org_domain: "flashbots.net".to_string(),
        }
    }
}

impl K8sConfig {
    /// Hostnames the serving certificate must cover.
    pub fn service_hosts(&self) -> Vec<String> {
        vec![
            format!("{}.{}.svc", self.service_name, self.namespace),
            format!("{}.{}.svc.cluster.local", self.service_name, self.namespace),
        ]
    }

    /// Prefix of the annotations written onto mutated pods.
    pub fn annotation_prefix(&self) -> String {
        format!("{}.{}", self.service_name, self.org_domain)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_address: String,
    pub path_healthcheck: String,
    /// Base path; each rule is served under `<pathWebhook>/<fingerprint>`.
    pub path_webhook: String,
    pub metrics_listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8443".to_string(),
            path_healthcheck: "/".to_string(),
            path_webhook: "/mutate".to_string(),
            metrics_listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Webhook path for one rule.
    pub fn webhook_path(&self, fingerprint: &str) -> String {
        format!("{}/{}", self.path_webhook.trim_end_matches('/'), fingerprint)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub mode: LogMode,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            mode: LogMode::Prod,
        }
    }
}

/// Log output format: JSON lines in production, human readable otherwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Prod,
    Dev,
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMode::Prod => write!(f, "prod"),
            LogMode::Dev => write!(f, "dev"),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn from_optional_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check everything that can be checked without a cluster and return the
    /// rule registry built along the way.
    pub fn validate(&self) -> Result<RuleRegistry, ConfigError> {
        if !self.server.path_webhook.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "webhook path {:?} must start with '/'",
                self.server.path_webhook
            )));
        }
        if !self.server.path_healthcheck.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "healthcheck path {:?} must start with '/'",
                self.server.path_healthcheck
            )));
        }
        if self.k8s.service_name.is_empty() || self.k8s.namespace.is_empty() {
            return Err(ConfigError::Invalid(
                "service name and namespace must be set".to_string(),
            ));
        }
        Ok(RuleRegistry::build(self.inject.iter().cloned())?)
    }
}
