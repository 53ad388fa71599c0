// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for kube-sidecar-injector.
//!
//! Uses proptest to generate random rules, pods and pointer segments and
//! verify invariants of fingerprinting, patch paths and mutation.

#[path = "../common/fixtures.rs"]
mod fixtures;

use std::collections::BTreeMap;

use jiff::Timestamp;
use kube_sidecar_injector::MutationOutcome;
use kube_sidecar_injector::patch::escape;
use kube_sidecar_injector::rules::{Fingerprint, InjectRule};
use proptest::prelude::*;

use fixtures::{PodBuilder, apply, engine_for, sidecar};

/// Strategy for generating container names.
fn container_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,10}"
}

/// Strategy for generating label keys, optionally with a prefix.
fn label_key() -> impl Strategy<Value = String> {
    "([a-z]{1,6}\\.io/)?[a-z]{1,8}"
}

fn labels() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(label_key(), "[a-z0-9]{0,8}", 0..4)
}

/// Strategy for rules that always inject at least one container.
fn any_rule() -> impl Strategy<Value = InjectRule> {
    (
        prop::collection::vec(container_name(), 1..4),
        labels(),
        1..5u32,
    )
        .prop_map(|(names, labels, max_iterations)| InjectRule {
            containers: names.iter().map(|name| sidecar(name, "busybox")).collect(),
            labels,
            max_iterations,
            ..Default::default()
        })
}

fn now() -> Timestamp {
    "2024-05-01T12:00:00Z".parse().unwrap()
}

proptest! {
    /// Equal rules hash equally regardless of their name.
    #[test]
    fn fingerprint_ignores_name(rule in any_rule(), name in "[a-z]{0,12}") {
        let mut renamed = rule.clone();
        renamed.name = name;
        prop_assert_eq!(rule.fingerprint(), renamed.fingerprint());
    }

    /// Renaming one injected container changes the fingerprint.
    #[test]
    fn fingerprint_tracks_container_names(rule in any_rule(), suffix in "[a-z]{1,4}") {
        let mut changed = rule.clone();
        changed.containers[0].name.push_str(&suffix);
        prop_assert_ne!(rule.fingerprint(), changed.fingerprint());
    }

    /// Label insertion order never matters.
    #[test]
    fn fingerprint_independent_of_insertion_order(labels in labels()) {
        let mut reversed = BTreeMap::new();
        for (key, value) in labels.iter().rev() {
            reversed.insert(key.clone(), value.clone());
        }
        let forward = InjectRule { labels, ..Default::default() };
        let backward = InjectRule { labels: reversed, ..Default::default() };
        prop_assert_eq!(forward.fingerprint(), backward.fingerprint());
    }

    /// Escaped segments contain no separator and unescape to the input.
    #[test]
    fn escape_round_trips(segment in "[a-z~/.]{0,16}") {
        let escaped = escape(&segment);
        prop_assert!(!escaped.contains('/'));
        let unescaped = escaped.replace("~1", "/").replace("~0", "~");
        prop_assert_eq!(unescaped, segment);
    }

    /// Applying the patch and admitting the result again yields nothing to do.
    #[test]
    fn mutation_is_idempotent(rule in any_rule(), pod_labels in labels()) {
        let (engine, fingerprint) = engine_for(rule);
        let mut builder = PodBuilder::new("web").container("main_app");
        for (key, value) in pod_labels {
            builder = builder.label(key, value);
        }
        let pod = builder.build();

        let first = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let patch = first.patch().expect("a fresh pod always needs containers");
        let patched = apply(&pod, patch);

        let second = engine.mutate_at(&fingerprint, &patched, now()).unwrap();
        prop_assert!(
            matches!(second, MutationOutcome::NothingToInject { .. }),
            "second admission produced {:?}",
            second
        );
    }
}
