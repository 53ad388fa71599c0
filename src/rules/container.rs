//! Sidecar container definitions.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use super::fingerprint::{Fingerprint, FingerprintHasher};
use super::quantity::parse_quantity;
use super::volume::InjectVolumeMount;
use super::{RuleError, ToCluster};

const PORT_PROTOCOLS: &[&str] = &["TCP", "UDP", "SCTP"];
const PULL_POLICIES: &[&str] = &["Always", "IfNotPresent", "Never"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectContainer {
    pub name: String,
    pub image: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<InjectEnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<InjectContainerPort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<InjectResources>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<InjectVolumeMount>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectEnvVar {
    pub name: String,

    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectContainerPort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub container_port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,

    #[serde(default, rename = "hostIP", skip_serializing_if = "String::is_empty")]
    pub host_ip: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

/// Requests and limits keyed by resource name (`cpu`, `memory`, ...).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectResources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl ToCluster for InjectContainer {
    type Output = Container;

    fn to_cluster(&self) -> Result<Container, RuleError> {
        let wrap = |source: RuleError| RuleError::InvalidContainer {
            name: self.name.clone(),
            source: Box::new(source),
        };

        if !self.image_pull_policy.is_empty()
            && !PULL_POLICIES.contains(&self.image_pull_policy.as_str())
        {
            return Err(wrap(RuleError::InvalidPullPolicy {
                policy: self.image_pull_policy.clone(),
            }));
        }

        let env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|var| EnvVar {
                name: var.name.clone(),
                value: Some(var.value.clone()),
                value_from: None,
            })
            .collect();
        let ports = self.ports.to_cluster().map_err(wrap)?;
        let resources = self
            .resources
            .as_ref()
            .map(ToCluster::to_cluster)
            .transpose()
            .map_err(wrap)?;
        let volume_mounts = self.volume_mounts.to_cluster().map_err(wrap)?;

        Ok(Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: (!self.image_pull_policy.is_empty())
                .then(|| self.image_pull_policy.clone()),
            command: (!self.command.is_empty()).then(|| self.command.clone()),
            args: (!self.args.is_empty()).then(|| self.args.clone()),
            env: (!env.is_empty()).then_some(env),
            ports: (!ports.is_empty()).then_some(ports),
            resources,
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            ..Default::default()
        })
    }
}

impl ToCluster for InjectContainerPort {
    type Output = ContainerPort;

    fn to_cluster(&self) -> Result<ContainerPort, RuleError> {
        for port in std::iter::once(self.container_port).chain(self.host_port) {
            if !(1..=65535).contains(&port) {
                return Err(RuleError::InvalidPort { port });
            }
        }
        if !self.protocol.is_empty() && !PORT_PROTOCOLS.contains(&self.protocol.as_str()) {
            return Err(RuleError::InvalidProtocol {
                protocol: self.protocol.clone(),
            });
        }
        Ok(ContainerPort {
            name: (!self.name.is_empty()).then(|| self.name.clone()),
            container_port: self.container_port,
            host_port: self.host_port,
            host_ip: (!self.host_ip.is_empty()).then(|| self.host_ip.clone()),
            protocol: (!self.protocol.is_empty()).then(|| self.protocol.clone()),
        })
    }
}

impl ToCluster for InjectResources {
    type Output = ResourceRequirements;

    fn to_cluster(&self) -> Result<ResourceRequirements, RuleError> {
        Ok(ResourceRequirements {
            requests: quantities(&self.requests)?,
            limits: quantities(&self.limits)?,
            ..Default::default()
        })
    }
}

fn quantities(
    values: &BTreeMap<String, String>,
) -> Result<Option<BTreeMap<String, Quantity>>, RuleError> {
    if values.is_empty() {
        return Ok(None);
    }
    values
        .iter()
        .map(|(name, value)| Ok((name.clone(), parse_quantity(value)?)))
        .collect::<Result<BTreeMap<_, _>, RuleError>>()
        .map(Some)
}

impl Fingerprint for InjectContainer {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("name", &self.name);
        hasher.str("image", &self.image);
        hasher.str("imagePullPolicy", &self.image_pull_policy);
        hasher.strings("command", &self.command);
        hasher.strings("args", &self.args);
        hasher.list("env", &self.env);
        hasher.list("ports", &self.ports);
        hasher.opt_nested("resources", self.resources.as_ref());
        hasher.list("volumeMounts", &self.volume_mounts);
    }
}

impl Fingerprint for InjectEnvVar {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("name", &self.name);
        hasher.str("value", &self.value);
    }
}

impl Fingerprint for InjectContainerPort {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("name", &self.name);
        hasher.opt_i32("containerPort", Some(self.container_port));
        hasher.opt_i32("hostPort", self.host_port);
        hasher.str("hostIP", &self.host_ip);
        hasher.str("protocol", &self.protocol);
    }
}

impl Fingerprint for InjectResources {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.map("requests", &self.requests);
        hasher.map("limits", &self.limits);
    }
}
