//! Fingerprint-indexed rule registry.
//!
//! Built once at startup and shared read-only between the reconciler and the
//! request handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Fingerprint, InjectRule, RuleError};

/// A validated rule together with its fingerprint.
#[derive(Clone, Debug)]
pub struct RegisteredRule {
    fingerprint: String,
    rule: Arc<InjectRule>,
}

impl RegisteredRule {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn rule(&self) -> &InjectRule {
        &self.rule
    }

    pub fn display_name(&self) -> String {
        self.rule.display_name(&self.fingerprint)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<RegisteredRule>,
    index: HashMap<String, usize>,
}

impl RuleRegistry {
    /// Validate every rule and index it by fingerprint, keeping
    /// configuration order. Two rules with the same fingerprint are an error.
    pub fn build(rules: impl IntoIterator<Item = InjectRule>) -> Result<Self, RuleError> {
        let mut registry = Self::default();
        for rule in rules {
            let fingerprint = rule.fingerprint();
            rule.validate().map_err(|source| RuleError::InvalidRule {
                rule: rule.display_name(&fingerprint),
                source: Box::new(source),
            })?;

            if let Some(existing) = registry.resolve(&fingerprint) {
                return Err(RuleError::DuplicateFingerprint {
                    first: existing.display_name(),
                    second: rule.display_name(&fingerprint),
                    fingerprint,
                });
            }

            debug!(fingerprint = %fingerprint, rule = %rule.display_name(&fingerprint), "Registered inject rule");
            registry
                .index
                .insert(fingerprint.clone(), registry.rules.len());
            registry.rules.push(RegisteredRule {
                fingerprint,
                rule: Arc::new(rule),
            });
        }
        Ok(registry)
    }

    pub fn resolve(&self, fingerprint: &str) -> Option<&RegisteredRule> {
        self.index
            .get(fingerprint)
            .and_then(|&position| self.rules.get(position))
    }

    /// Rules in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
