//! Label selectors used to scope a rule to pods and namespaces.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use serde::{Deserialize, Serialize};

use super::fingerprint::{Fingerprint, FingerprintHasher};
use super::{RuleError, ToCluster};

const LABEL_SELECTOR_OPERATORS: &[&str] = &["In", "NotIn", "Exists", "DoesNotExist"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectLabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<InjectMatchExpression>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InjectMatchExpression {
    pub key: String,
    pub operator: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl ToCluster for InjectLabelSelector {
    type Output = LabelSelector;

    fn to_cluster(&self) -> Result<LabelSelector, RuleError> {
        let match_expressions = self.match_expressions.to_cluster()?;
        Ok(LabelSelector {
            match_labels: (!self.match_labels.is_empty()).then(|| self.match_labels.clone()),
            match_expressions: (!match_expressions.is_empty()).then_some(match_expressions),
        })
    }
}

impl ToCluster for InjectMatchExpression {
    type Output = LabelSelectorRequirement;

    fn to_cluster(&self) -> Result<LabelSelectorRequirement, RuleError> {
        check_requirement("label selector", &self.operator, &self.values, LABEL_SELECTOR_OPERATORS)?;
        Ok(LabelSelectorRequirement {
            key: self.key.clone(),
            operator: self.operator.clone(),
            values: (!self.values.is_empty()).then(|| self.values.clone()),
        })
    }
}

/// Validate an operator against `allowed` and check that the value list
/// matches its arity. Set-based operators need values, existence checks
/// must have none.
pub(crate) fn check_requirement(
    context: &'static str,
    operator: &str,
    values: &[String],
    allowed: &[&str],
) -> Result<(), RuleError> {
    if !allowed.contains(&operator) {
        return Err(RuleError::InvalidOperator {
            context,
            operator: operator.to_string(),
        });
    }
    let needs_values = matches!(operator, "In" | "NotIn");
    let forbids_values = matches!(operator, "Exists" | "DoesNotExist");
    if (needs_values && values.is_empty()) || (forbids_values && !values.is_empty()) {
        return Err(RuleError::InvalidRequirementValues {
            context,
            operator: operator.to_string(),
        });
    }
    Ok(())
}

impl Fingerprint for InjectLabelSelector {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.map("matchLabels", &self.match_labels);
        hasher.list("matchExpressions", &self.match_expressions);
    }
}

impl Fingerprint for InjectMatchExpression {
    fn feed(&self, hasher: &mut FingerprintHasher) {
        hasher.str("key", &self.key);
        hasher.str("operator", &self.operator);
        hasher.strings("values", &self.values);
    }
}
