//! Injection rules.
//!
//! A rule describes what gets added to a matching pod: containers, volumes,
//! mounts for existing containers, labels, annotations, node affinity and
//! tolerations. Rules are declared in the YAML configuration using the field
//! names below and converted to their Kubernetes API counterparts through
//! [`ToCluster`], which is also where they are validated.
//!
//! Each rule is identified by its [`fingerprint`](Fingerprint::fingerprint).
//! The fingerprint is part of the webhook URL registered with the API server,
//! so a rule that changes content also changes its endpoint.

pub mod container;
pub mod fingerprint;
pub mod quantity;
pub mod registry;
pub mod scheduling;
pub mod selector;
pub mod volume;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use container::{InjectContainer, InjectContainerPort, InjectEnvVar, InjectResources};
pub use fingerprint::{Fingerprint, FingerprintHasher};
pub use registry::{RegisteredRule, RuleRegistry};
pub use scheduling::{
    InjectAffinity, InjectNodeAffinity, InjectNodeSelector, InjectNodeSelectorRequirement,
    InjectNodeSelectorTerm, InjectToleration,
};
pub use selector::{InjectLabelSelector, InjectMatchExpression};
pub use volume::{
    InjectConfigMapVolume, InjectEmptyDirVolume, InjectKeyToPath, InjectSecretVolume,
    InjectVolume, InjectVolumeMount,
};

/// Errors raised while validating or converting rules
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid quantity {value:?}")]
    InvalidQuantity { value: String },

    #[error("invalid {context} operator {operator:?}")]
    InvalidOperator {
        context: &'static str,
        operator: String,
    },

    #[error("{context} operator {operator:?} has the wrong number of values")]
    InvalidRequirementValues {
        context: &'static str,
        operator: String,
    },

    #[error("invalid toleration effect {effect:?}")]
    InvalidEffect { effect: String },

    #[error("invalid container port {port}")]
    InvalidPort { port: i32 },

    #[error("invalid port protocol {protocol:?}")]
    InvalidProtocol { protocol: String },

    #[error("invalid image pull policy {policy:?}")]
    InvalidPullPolicy { policy: String },

    #[error("invalid container {name:?}: {source}")]
    InvalidContainer {
        name: String,
        #[source]
        source: Box<RuleError>,
    },

    #[error("invalid volume {name:?}: {reason}")]
    InvalidVolume { name: String, reason: String },

    #[error("invalid volume mount {name:?}: {reason}")]
    InvalidVolumeMount { name: String, reason: String },

    #[error("invalid rule name {name:?}: must be at most 63 alphanumerics, '-', '_' or '.', starting and ending with an alphanumeric")]
    InvalidName { name: String },

    #[error("invalid inject rule {rule}: {source}")]
    InvalidRule {
        rule: String,
        #[source]
        source: Box<RuleError>,
    },

    #[error("inject rules {first} and {second} have the same fingerprint {fingerprint}")]
    DuplicateFingerprint {
        fingerprint: String,
        first: String,
        second: String,
    },
}

/// Conversion from a configuration type to the Kubernetes API type it
/// describes, validating along the way.
pub trait ToCluster {
    type Output;

    fn to_cluster(&self) -> Result<Self::Output, RuleError>;
}

impl<T: ToCluster> ToCluster for [T] {
    type Output = Vec<T::Output>;

    fn to_cluster(&self) -> Result<Self::Output, RuleError> {
        self.iter().map(ToCluster::to_cluster).collect()
    }
}

impl<T: ToCluster> ToCluster for Vec<T> {
    type Output = Vec<T::Output>;

    fn to_cluster(&self) -> Result<Self::Output, RuleError> {
        self.as_slice().to_cluster()
    }
}

/// Rule names end up as the name part of a pod annotation key.
static RULE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").ok());

const MAX_RULE_NAME_LEN: usize = 63;

fn default_max_iterations() -> u32 {
    1
}

/// One injection rule as declared in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectRule {
    /// Human readable name. Not part of the fingerprint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// How many times the rule may mutate the same pod.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<InjectLabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<InjectLabelSelector>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<InjectAffinity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<InjectToleration>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<InjectContainer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<InjectVolume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<InjectVolumeMount>,
}

impl Default for InjectRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_iterations: default_max_iterations(),
            label_selector: None,
            namespace_selector: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            affinity: None,
            tolerations: Vec::new(),
            containers: Vec::new(),
            volumes: Vec::new(),
            volume_mounts: Vec::new(),
        }
    }
}

impl InjectRule {
    /// Name for logs and metrics: the configured name, or the fingerprint
    /// for unnamed rules.
    pub fn display_name(&self, fingerprint: &str) -> String {
        if self.name.is_empty() {
            fingerprint.to_string()
        } else {
            self.name.clone()
        }
    }

    /// Run every conversion once so that broken rules fail at startup
    /// instead of on the first admission request.
    pub fn validate(&self) -> Result<(), RuleError> {
        if !self.name.is_empty()
            && (self.name.len() > MAX_RULE_NAME_LEN
                || !RULE_NAME.as_ref().is_some_and(|re| re.is_match(&self.name)))
        {
            return Err(RuleError::InvalidName {
                name: self.name.clone(),
            });
        }
        if let Some(selector) = &self.label_selector {
            selector.to_cluster()?;
        }
        if let Some(selector) = &self.namespace_selector {
            selector.to_cluster()?;
        }
        if let Some(affinity) = &self.affinity {
            affinity.to_cluster()?;
        }
        self.tolerations.to_cluster()?;
        self.containers.to_cluster()?;
        self.volumes.to_cluster()?;
        self.volume_mounts.to_cluster()?;
        Ok(())
    }
}

impl Fingerprint for InjectRule {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.u32("maxIterations", self.max_iterations);
        hasher.opt_nested("labelSelector", self.label_selector.as_ref());
        hasher.opt_nested("namespaceSelector", self.namespace_selector.as_ref());
        hasher.map("labels", &self.labels);
        hasher.map("annotations", &self.annotations);
        hasher.opt_nested("affinity", self.affinity.as_ref());
        hasher.list("tolerations", &self.tolerations);
        hasher.list("containers", &self.containers);
        hasher.list("volumes", &self.volumes);
        hasher.list("volumeMounts", &self.volume_mounts);
    }
}
