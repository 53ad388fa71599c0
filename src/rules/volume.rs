//! Volumes and volume mounts contributed by a rule.

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, KeyToPath, SecretVolumeSource, Volume,
    VolumeMount,
};
use serde::{Deserialize, Serialize};

use super::fingerprint::{Fingerprint, FingerprintHasher};
use super::quantity::parse_quantity;
use super::{RuleError, ToCluster};

const MOUNT_PROPAGATIONS: &[&str] = &["None", "HostToContainer", "Bidirectional"];
const RECURSIVE_READ_ONLY_MODES: &[&str] = &["Disabled", "IfPossible", "Enabled"];

/// A pod volume. At most one source may be set; a volume without a source is
/// defaulted to an emptyDir by the API server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectVolume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<InjectConfigMapVolume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<InjectSecretVolume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<InjectEmptyDirVolume>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectConfigMapVolume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<InjectKeyToPath>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectSecretVolume {
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<InjectKeyToPath>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectEmptyDirVolume {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub medium: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size_limit: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectKeyToPath {
    pub key: String,
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectVolumeMount {
    pub name: String,
    pub mount_path: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recursive_read_only: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_propagation: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_path_expr: String,
}

impl ToCluster for InjectVolume {
    type Output = Volume;

    fn to_cluster(&self) -> Result<Volume, RuleError> {
        let sources = usize::from(self.config_map.is_some())
            + usize::from(self.secret.is_some())
            + usize::from(self.empty_dir.is_some());
        if sources > 1 {
            return Err(RuleError::InvalidVolume {
                name: self.name.clone(),
                reason: "more than one volume source is set".to_string(),
            });
        }

        let wrap = |source: RuleError| RuleError::InvalidVolume {
            name: self.name.clone(),
            reason: source.to_string(),
        };

        Ok(Volume {
            name: self.name.clone(),
            config_map: self
                .config_map
                .as_ref()
                .map(ToCluster::to_cluster)
                .transpose()
                .map_err(wrap)?,
            secret: self
                .secret
                .as_ref()
                .map(ToCluster::to_cluster)
                .transpose()
                .map_err(wrap)?,
            empty_dir: self
                .empty_dir
                .as_ref()
                .map(ToCluster::to_cluster)
                .transpose()
                .map_err(wrap)?,
            ..Default::default()
        })
    }
}

impl ToCluster for InjectConfigMapVolume {
    type Output = ConfigMapVolumeSource;

    fn to_cluster(&self) -> Result<ConfigMapVolumeSource, RuleError> {
        let items = self.items.to_cluster()?;
        Ok(ConfigMapVolumeSource {
            name: self.name.clone(),
            items: (!items.is_empty()).then_some(items),
            default_mode: self.default_mode,
            optional: self.optional,
        })
    }
}

impl ToCluster for InjectSecretVolume {
    type Output = SecretVolumeSource;

    fn to_cluster(&self) -> Result<SecretVolumeSource, RuleError> {
        let items = self.items.to_cluster()?;
        Ok(SecretVolumeSource {
            secret_name: Some(self.secret_name.clone()),
            items: (!items.is_empty()).then_some(items),
            default_mode: self.default_mode,
            optional: self.optional,
        })
    }
}

impl ToCluster for InjectEmptyDirVolume {
    type Output = EmptyDirVolumeSource;

    fn to_cluster(&self) -> Result<EmptyDirVolumeSource, RuleError> {
        let size_limit = if self.size_limit.is_empty() {
            None
        } else {
            Some(parse_quantity(&self.size_limit)?)
        };
        Ok(EmptyDirVolumeSource {
            medium: (!self.medium.is_empty()).then(|| self.medium.clone()),
            size_limit,
        })
    }
}

impl ToCluster for InjectKeyToPath {
    type Output = KeyToPath;

    fn to_cluster(&self) -> Result<KeyToPath, RuleError> {
        Ok(KeyToPath {
            key: self.key.clone(),
            path: self.path.clone(),
            mode: self.mode,
        })
    }
}

impl ToCluster for InjectVolumeMount {
    type Output = VolumeMount;

    fn to_cluster(&self) -> Result<VolumeMount, RuleError> {
        if !self.mount_propagation.is_empty()
            && !MOUNT_PROPAGATIONS.contains(&self.mount_propagation.as_str())
        {
            return Err(RuleError::InvalidVolumeMount {
                name: self.name.clone(),
                reason: format!("unknown mount propagation {:?}", self.mount_propagation),
            });
        }
        if !self.recursive_read_only.is_empty()
            && !RECURSIVE_READ_ONLY_MODES.contains(&self.recursive_read_only.as_str())
        {
            return Err(RuleError::InvalidVolumeMount {
                name: self.name.clone(),
                reason: format!(
                    "unknown recursive read-only mode {:?}",
                    self.recursive_read_only
                ),
            });
        }
        Ok(VolumeMount {
            name: self.name.clone(),
            mount_path: self.mount_path.clone(),
            read_only: self.read_only.then_some(true),
            recursive_read_only: non_empty(&self.recursive_read_only),
            mount_propagation: non_empty(&self.mount_propagation),
            sub_path: non_empty(&self.sub_path),
            sub_path_expr: non_empty(&self.sub_path_expr),
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl Fingerprint for InjectVolume {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("name", &self.name);
        hasher.opt_nested("configMap", self.config_map.as_ref());
        hasher.opt_nested("secret", self.secret.as_ref());
        hasher.opt_nested("emptyDir", self.empty_dir.as_ref());
    }
}

impl Fingerprint for InjectConfigMapVolume {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("name", &self.name);
        hasher.list("items", &self.items);
        hasher.opt_i32("defaultMode", self.default_mode);
        hasher.opt_bool("optional", self.optional);
    }
}

impl Fingerprint for InjectSecretVolume {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("secretName", &self.secret_name);
        hasher.list("items", &self.items);
        hasher.opt_i32("defaultMode", self.default_mode);
        hasher.opt_bool("optional", self.optional);
    }
}

impl Fingerprint for InjectEmptyDirVolume {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("medium", &self.medium);
        hasher.str("sizeLimit", &self.size_limit);
    }
}

impl Fingerprint for InjectKeyToPath {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("key", &self.key);
        hasher.str("path", &self.path);
        hasher.opt_i32("mode", self.mode);
    }
}

impl Fingerprint for InjectVolumeMount {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("name", &self.name);
        hasher.str("mountPath", &self.mount_path);
        hasher.opt_bool("readOnly", self.read_only.then_some(true));
        hasher.str("recursiveReadOnly", &self.recursive_read_only);
        hasher.str("mountPropagation", &self.mount_propagation);
        hasher.str("subPath", &self.sub_path);
        hasher.str("subPathExpr", &self.sub_path_expr);
    }
}
