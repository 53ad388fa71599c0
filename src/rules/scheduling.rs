//! Node affinity and tolerations contributed by a rule.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Toleration,
};
use serde::{Deserialize, Serialize};

use super::fingerprint::{Fingerprint, FingerprintHasher};
use super::selector::check_requirement;
use super::{RuleError, ToCluster};

const NODE_SELECTOR_OPERATORS: &[&str] = &["In", "NotIn", "Exists", "DoesNotExist", "Gt", "Lt"];
const TOLERATION_OPERATORS: &[&str] = &["Exists", "Equal"];
const TOLERATION_EFFECTS: &[&str] = &["NoSchedule", "PreferNoSchedule", "NoExecute"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectAffinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<InjectNodeAffinity>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectNodeAffinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_during_scheduling_ignored_during_execution: Option<InjectNodeSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectNodeSelector {
    #[serde(default)]
    pub node_selector_terms: Vec<InjectNodeSelectorTerm>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectNodeSelectorTerm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<InjectNodeSelectorRequirement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<InjectNodeSelectorRequirement>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectNodeSelectorRequirement {
    pub key: String,
    pub operator: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectToleration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub effect: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

impl InjectAffinity {
    pub fn is_empty(&self) -> bool {
        self.node_affinity
            .as_ref()
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
            .is_none_or(|selector| selector.node_selector_terms.is_empty())
    }
}

impl ToCluster for InjectAffinity {
    type Output = Affinity;

    fn to_cluster(&self) -> Result<Affinity, RuleError> {
        Ok(Affinity {
            node_affinity: self
                .node_affinity
                .as_ref()
                .map(ToCluster::to_cluster)
                .transpose()?,
            ..Default::default()
        })
    }
}

impl ToCluster for InjectNodeAffinity {
    type Output = NodeAffinity;

    fn to_cluster(&self) -> Result<NodeAffinity, RuleError> {
        Ok(NodeAffinity {
            required_during_scheduling_ignored_during_execution: self
                .required_during_scheduling_ignored_during_execution
                .as_ref()
                .map(ToCluster::to_cluster)
                .transpose()?,
            ..Default::default()
        })
    }
}

impl ToCluster for InjectNodeSelector {
    type Output = NodeSelector;

    fn to_cluster(&self) -> Result<NodeSelector, RuleError> {
        Ok(NodeSelector {
            node_selector_terms: self.node_selector_terms.to_cluster()?,
        })
    }
}

impl ToCluster for InjectNodeSelectorTerm {
    type Output = NodeSelectorTerm;

    fn to_cluster(&self) -> Result<NodeSelectorTerm, RuleError> {
        let match_expressions = self.match_expressions.to_cluster()?;
        let match_fields = self.match_fields.to_cluster()?;
        Ok(NodeSelectorTerm {
            match_expressions: (!match_expressions.is_empty()).then_some(match_expressions),
            match_fields: (!match_fields.is_empty()).then_some(match_fields),
        })
    }
}

impl ToCluster for InjectNodeSelectorRequirement {
    type Output = NodeSelectorRequirement;

    fn to_cluster(&self) -> Result<NodeSelectorRequirement, RuleError> {
        check_requirement("node selector", &self.operator, &self.values, NODE_SELECTOR_OPERATORS)?;
        Ok(NodeSelectorRequirement {
            key: self.key.clone(),
            operator: self.operator.clone(),
            values: (!self.values.is_empty()).then(|| self.values.clone()),
        })
    }
}

impl ToCluster for InjectToleration {
    type Output = Toleration;

    fn to_cluster(&self) -> Result<Toleration, RuleError> {
        if !self.operator.is_empty() && !TOLERATION_OPERATORS.contains(&self.operator.as_str()) {
            return Err(RuleError::InvalidOperator {
                context: "toleration",
                operator: self.operator.clone(),
            });
        }
        if !self.effect.is_empty() && !TOLERATION_EFFECTS.contains(&self.effect.as_str()) {
            return Err(RuleError::InvalidEffect {
                effect: self.effect.clone(),
            });
        }
        Ok(Toleration {
            key: non_empty(&self.key),
            operator: non_empty(&self.operator),
            value: non_empty(&self.value),
            effect: non_empty(&self.effect),
            toleration_seconds: self.toleration_seconds,
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl Fingerprint for InjectAffinity {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.opt_nested("nodeAffinity", self.node_affinity.as_ref());
    }
}

impl Fingerprint for InjectNodeAffinity {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.opt_nested(
            "requiredDuringSchedulingIgnoredDuringExecution",
            self.required_during_scheduling_ignored_during_execution
                .as_ref(),
        );
    }
}

impl Fingerprint for InjectNodeSelector {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.list("nodeSelectorTerms", &self.node_selector_terms);
    }
}

impl Fingerprint for InjectNodeSelectorTerm {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.list("matchExpressions", &self.match_expressions);
        hasher.list("matchFields", &self.match_fields);
    }
}

impl Fingerprint for InjectNodeSelectorRequirement {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("key", &self.key);
        hasher.str("operator", &self.operator);
        hasher.strings("values", &self.values);
    }
}

impl Fingerprint for InjectToleration {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("key", &self.key);
        hasher.str("operator", &self.operator);
        hasher.str("value", &self.value);
        hasher.str("effect", &self.effect);
        hasher.opt_i64("tolerationSeconds", self.toleration_seconds);
    }
}
