//! Pod mutation.
//!
//! Given a pod and the fingerprint from the request path, the engine builds
//! the JSON Patch that applies the matching rule. Stages run in a fixed order:
//!
//! 1. volumes
//! 2. volume mounts on every existing init container, then every container
//! 3. containers
//! 4. node affinity, only if the pod has no required node affinity of its own
//! 5. tolerations
//! 6. labels
//! 7. annotations, merged with the circuit breaker bookkeeping
//!
//! Anything already present on the pod (a volume or container with the same
//! name, a mount on the same path, an identical toleration) is skipped, so a
//! pod that was already mutated produces no further operations. Existing pod
//! fields are never removed or reordered.

pub mod circuit_breaker;

use std::collections::HashSet;
use std::sync::Arc;

use jiff::Timestamp;
use json_patch::{Patch, PatchOperation};
use k8s_openapi::api::core::v1::{Affinity, NodeAffinity, Pod, PodSpec, Toleration};
use thiserror::Error;
use tracing::{debug, warn};

use crate::patch::{self, PatchError, add, pointer};
use crate::rules::{InjectRule, RuleError, RuleRegistry, ToCluster};

pub use circuit_breaker::{CircuitBreaker, Verdict};

/// Errors raised while mutating a single pod
#[derive(Error, Debug)]
pub enum MutationError {
    #[error("pod has no spec")]
    MissingSpec,

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// What the engine decided for one request.
#[derive(Debug)]
pub enum MutationOutcome {
    Patched { rule: String, patch: Patch },
    /// No rule is registered under the requested fingerprint.
    UnknownRule,
    /// Everything the rule contributes is already on the pod.
    NothingToInject { rule: String },
    IterationLimitReached { rule: String, iterations: u32 },
}

impl MutationOutcome {
    pub fn patch(&self) -> Option<&Patch> {
        match self {
            MutationOutcome::Patched { patch, .. } => Some(patch),
            _ => None,
        }
    }

    pub fn into_patch(self) -> Option<Patch> {
        match self {
            MutationOutcome::Patched { patch, .. } => Some(patch),
            _ => None,
        }
    }
}

pub struct MutationEngine {
    registry: Arc<RuleRegistry>,
    annotation_prefix: String,
}

impl MutationEngine {
    /// `annotation_prefix` is the `<service>.<org domain>` part of the
    /// bookkeeping annotation keys.
    pub fn new(registry: Arc<RuleRegistry>, annotation_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            annotation_prefix: annotation_prefix.into(),
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn mutate(&self, fingerprint: &str, pod: &Pod) -> Result<MutationOutcome, MutationError> {
        self.mutate_at(fingerprint, pod, Timestamp::now())
    }

    /// Like [`mutate`](Self::mutate) with an explicit clock.
    pub fn mutate_at(
        &self,
        fingerprint: &str,
        pod: &Pod,
        now: Timestamp,
    ) -> Result<MutationOutcome, MutationError> {
        let Some(registered) = self.registry.resolve(fingerprint) else {
            warn!(fingerprint = %fingerprint, "No inject rule registered for fingerprint");
            return Ok(MutationOutcome::UnknownRule);
        };
        let rule = registered.rule();
        let rule_name = registered.display_name();
        let spec = pod.spec.as_ref().ok_or(MutationError::MissingSpec)?;

        let mut ops = Vec::new();
        inject_volumes(rule, spec, &mut ops)?;
        inject_volume_mounts(rule, spec, &mut ops)?;
        inject_containers(rule, spec, &mut ops)?;
        inject_affinity(rule, spec, &mut ops)?;
        inject_tolerations(rule, spec, &mut ops)?;
        patch::merge_map(
            &["metadata", "labels"],
            pod.metadata.labels.as_ref(),
            &rule.labels,
            &mut ops,
        )?;

        let annotations = pod.metadata.annotations.as_ref();
        let annotations_pending = rule
            .annotations
            .iter()
            .any(|(key, value)| annotations.and_then(|a| a.get(key)) != Some(value));
        if ops.is_empty() && !annotations_pending {
            debug!(rule = %rule_name, "Nothing to inject");
            return Ok(MutationOutcome::NothingToInject { rule: rule_name });
        }

        let breaker = CircuitBreaker::new(&self.annotation_prefix, registered);
        let bookkeeping = match breaker.evaluate(annotations, now) {
            Verdict::Tripped { iterations } => {
                warn!(
                    rule = %rule_name,
                    iterations,
                    max_iterations = rule.max_iterations,
                    "Iteration limit reached, not mutating"
                );
                return Ok(MutationOutcome::IterationLimitReached {
                    rule: rule_name,
                    iterations,
                });
            }
            Verdict::Proceed(bookkeeping) => bookkeeping,
        };

        let mut desired = rule.annotations.clone();
        desired.extend(bookkeeping);
        patch::merge_map(&["metadata", "annotations"], annotations, &desired, &mut ops)?;

        debug!(rule = %rule_name, operations = ops.len(), "Built patch");
        Ok(MutationOutcome::Patched {
            rule: rule_name,
            patch: Patch(ops),
        })
    }
}

fn inject_volumes(
    rule: &InjectRule,
    spec: &PodSpec,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), MutationError> {
    let existing = spec.volumes.as_deref().unwrap_or_default();
    let mut taken: HashSet<&str> = existing.iter().map(|v| v.name.as_str()).collect();
    let mut pending = Vec::new();
    for volume in &rule.volumes {
        if !taken.insert(volume.name.as_str()) {
            warn!(volume = %volume.name, "Volume already present on pod, skipping");
            continue;
        }
        pending.push(volume.to_cluster()?);
    }
    patch::append(&["spec", "volumes"], existing.len(), &pending, ops)?;
    Ok(())
}

fn inject_volume_mounts(
    rule: &InjectRule,
    spec: &PodSpec,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), MutationError> {
    if rule.volume_mounts.is_empty() {
        return Ok(());
    }
    let mounts = rule.volume_mounts.to_cluster()?;
    let groups = [
        ("initContainers", spec.init_containers.as_deref().unwrap_or_default()),
        ("containers", spec.containers.as_slice()),
    ];

    for (field, containers) in groups {
        for (index, container) in containers.iter().enumerate() {
            let existing = container.volume_mounts.as_deref().unwrap_or_default();
            let mut taken: HashSet<&str> =
                existing.iter().map(|m| m.mount_path.as_str()).collect();
            let mut pending = Vec::new();
            for mount in &mounts {
                if !taken.insert(mount.mount_path.as_str()) {
                    warn!(
                        container = %container.name,
                        mount_path = %mount.mount_path,
                        "Mount path already used in container, skipping"
                    );
                    continue;
                }
                pending.push(mount);
            }
            let index = index.to_string();
            patch::append(
                &["spec", field, &index, "volumeMounts"],
                existing.len(),
                &pending,
                ops,
            )?;
        }
    }
    Ok(())
}

fn inject_containers(
    rule: &InjectRule,
    spec: &PodSpec,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), MutationError> {
    let mut taken: HashSet<&str> = spec.containers.iter().map(|c| c.name.as_str()).collect();
    let mut pending = Vec::new();
    for container in &rule.containers {
        if !taken.insert(container.name.as_str()) {
            warn!(container = %container.name, "Container already present on pod, skipping");
            continue;
        }
        pending.push(container.to_cluster()?);
    }
    patch::append(&["spec", "containers"], spec.containers.len(), &pending, ops)?;
    Ok(())
}

fn inject_affinity(
    rule: &InjectRule,
    spec: &PodSpec,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), MutationError> {
    let Some(affinity) = rule.affinity.as_ref().filter(|a| !a.is_empty()) else {
        return Ok(());
    };

    let pod_node_affinity = spec.affinity.as_ref().and_then(|a| a.node_affinity.as_ref());
    let has_required = pod_node_affinity
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
        .is_some_and(|selector| !selector.node_selector_terms.is_empty());
    if has_required {
        warn!("Pod already requires a node affinity, skipping");
        return Ok(());
    }

    let Some(required) = affinity
        .to_cluster()?
        .node_affinity
        .and_then(|na| na.required_during_scheduling_ignored_during_execution)
    else {
        return Ok(());
    };

    // Add at the shallowest missing level so sibling settings on the pod survive.
    let op = match (spec.affinity.as_ref(), pod_node_affinity) {
        (None, _) => add(
            pointer(["spec", "affinity"])?,
            &Affinity {
                node_affinity: Some(NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(required),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )?,
        (Some(_), None) => add(
            pointer(["spec", "affinity", "nodeAffinity"])?,
            &NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(required),
                ..Default::default()
            },
        )?,
        (Some(_), Some(_)) => add(
            pointer([
                "spec",
                "affinity",
                "nodeAffinity",
                "requiredDuringSchedulingIgnoredDuringExecution",
            ])?,
            &required,
        )?,
    };
    ops.push(op);
    Ok(())
}

fn inject_tolerations(
    rule: &InjectRule,
    spec: &PodSpec,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), MutationError> {
    let existing = spec.tolerations.as_deref().unwrap_or_default();
    let mut pending: Vec<Toleration> = Vec::new();
    for toleration in &rule.tolerations {
        let toleration = toleration.to_cluster()?;
        if existing.contains(&toleration) || pending.contains(&toleration) {
            debug!(key = ?toleration.key, "Toleration already present on pod, skipping");
            continue;
        }
        pending.push(toleration);
    }
    patch::append(&["spec", "tolerations"], existing.len(), &pending, ops)?;
    Ok(())
}
