//! Per-rule iteration cap stored on the pod itself.
//!
//! Every successful mutation bumps a counter annotation keyed by the rule's
//! fingerprint and stamps the time it ran. Once the counter reaches the
//! rule's `maxIterations` the rule stops patching that pod, which stops
//! reinvocation loops between webhooks that keep undoing each other.

use std::collections::BTreeMap;

use jiff::{Timestamp, Unit};

use crate::rules::RegisteredRule;

#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The rule already ran `iterations` times on this pod.
    Tripped { iterations: u32 },
    /// Annotations to write alongside the patch.
    Proceed(BTreeMap<String, String>),
}

pub struct CircuitBreaker<'a> {
    prefix: &'a str,
    rule: &'a RegisteredRule,
}

impl<'a> CircuitBreaker<'a> {
    pub fn new(prefix: &'a str, rule: &'a RegisteredRule) -> Self {
        Self { prefix, rule }
    }

    /// Annotation holding the iteration counter.
    pub fn counter_key(&self) -> String {
        format!("{}/{}", self.prefix, self.rule.fingerprint())
    }

    /// Annotation holding the time of the last mutation.
    pub fn timestamp_key(&self) -> String {
        let name = &self.rule.rule().name;
        if name.is_empty() {
            format!("{}/{}-processed", self.prefix, self.rule.fingerprint())
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Current counter value. Absent or unparsable counters read as zero.
    pub fn iterations(&self, annotations: Option<&BTreeMap<String, String>>) -> u32 {
        annotations
            .and_then(|annotations| annotations.get(&self.counter_key()))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn evaluate(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
        now: Timestamp,
    ) -> Verdict {
        let iterations = self.iterations(annotations);
        if iterations >= self.rule.rule().max_iterations {
            return Verdict::Tripped { iterations };
        }

        let now = now.round(Unit::Second).unwrap_or(now);
        Verdict::Proceed(BTreeMap::from([
            (self.counter_key(), iterations.saturating_add(1).to_string()),
            (self.timestamp_key(), now.to_string()),
        ]))
    }
}
