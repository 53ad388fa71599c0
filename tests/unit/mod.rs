// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for kube-sidecar-injector.
//!
//! These tests run without a Kubernetes cluster and exercise the public
//! library surface: rule registry, mutation engine, circuit breaker and
//! certificate authority.

#[path = "../common/fixtures.rs"]
mod fixtures;

mod registry_tests {
    use std::collections::BTreeMap;

    use kube_sidecar_injector::rules::{
        Fingerprint, InjectLabelSelector, InjectMatchExpression, InjectRule, RuleError,
        RuleRegistry,
    };

    use crate::fixtures::{node_exporter_rule, sidecar};

    #[test]
    fn test_resolve_by_fingerprint() {
        let rule = node_exporter_rule();
        let fingerprint = rule.fingerprint();
        let registry = RuleRegistry::build([rule]).unwrap();

        let registered = registry.resolve(&fingerprint).unwrap();
        assert_eq!(registered.display_name(), "node-exporter");
        assert!(registry.resolve("0000000000000000").is_none());
    }

    #[test]
    fn test_fingerprint_is_sixteen_hex_chars() {
        let fingerprint = node_exporter_rule().fingerprint();
        assert_eq!(fingerprint.len(), 16);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_unnamed_rule_displays_fingerprint() {
        let rule = InjectRule {
            containers: vec![sidecar("proxy", "envoy:v1")],
            ..Default::default()
        };
        let fingerprint = rule.fingerprint();
        let registry = RuleRegistry::build([rule]).unwrap();
        assert_eq!(registry.resolve(&fingerprint).unwrap().display_name(), fingerprint);
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let first = node_exporter_rule();
        let mut second = first.clone();
        second.name = "renamed".to_string();

        let err = RuleRegistry::build([first, second]).unwrap_err();
        assert!(matches!(err, RuleError::DuplicateFingerprint { .. }), "{err}");
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let rule = InjectRule {
            name: "broken".to_string(),
            label_selector: Some(InjectLabelSelector {
                match_labels: BTreeMap::new(),
                match_expressions: vec![InjectMatchExpression {
                    key: "app".to_string(),
                    operator: "Like".to_string(),
                    values: vec!["web".to_string()],
                }],
            }),
            ..Default::default()
        };
        let err = RuleRegistry::build([rule]).unwrap_err();
        assert!(err.to_string().contains("broken"), "{err}");
    }

    #[test]
    fn test_name_unusable_in_annotation_key_rejected() {
        let mut rule = node_exporter_rule();
        rule.name = "node exporter/v1".to_string();
        let err = RuleRegistry::build([rule]).unwrap_err();
        assert!(
            matches!(&err, RuleError::InvalidRule { source, .. } if matches!(**source, RuleError::InvalidName { .. })),
            "{err}"
        );
    }

    #[test]
    fn test_iteration_order_follows_configuration() {
        let mut rules = Vec::new();
        for name in ["c", "a", "b"] {
            rules.push(InjectRule {
                name: name.to_string(),
                containers: vec![sidecar(name, "busybox")],
                ..Default::default()
            });
        }
        let registry = RuleRegistry::build(rules).unwrap();
        let names: Vec<String> = registry.iter().map(|r| r.display_name()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}

mod engine_tests {
    use jiff::Timestamp;
    use k8s_openapi::api::core::v1::Toleration;
    use kube_sidecar_injector::MutationOutcome;
    use kube_sidecar_injector::rules::InjectRule;
    use serde_json::{Value, json};

    use crate::fixtures::{PREFIX, PodBuilder, apply, engine_for, mount, node_exporter_rule, sidecar};

    fn now() -> Timestamp {
        "2024-05-01T12:00:00Z".parse().unwrap()
    }

    fn ops_json(outcome: &MutationOutcome) -> Vec<Value> {
        let patch = outcome.patch().expect("expected a patch");
        match serde_json::to_value(patch).unwrap() {
            Value::Array(ops) => ops,
            other => panic!("patch serialized to {other}"),
        }
    }

    #[test]
    fn test_node_exporter_end_to_end() {
        let (engine, fingerprint) = engine_for(node_exporter_rule());
        let pod = PodBuilder::new("web").container("nginx").label("app", "web").build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let patched = apply(&pod, outcome.patch().unwrap());

        let spec = patched.spec.as_ref().unwrap();
        let names: Vec<&str> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["nginx", "node-exporter"]);

        let exporter = &spec.containers[1];
        assert_eq!(exporter.image.as_deref(), Some("prom/node-exporter:v1.7.0"));
        assert_eq!(exporter.args.as_deref().unwrap(), ["--path.rootfs=/host"]);
        let requests = exporter.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["cpu"].0, "10m");
        assert_eq!(requests["memory"].0, "32Mi");

        assert_eq!(spec.volumes.as_ref().unwrap()[0].name, "host-root");
        assert_eq!(
            spec.tolerations.as_ref().unwrap()[0].key.as_deref(),
            Some("dedicated")
        );

        let labels = patched.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "web");
        assert_eq!(labels["monitoring"], "enabled");

        let annotations = patched.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["prometheus.io/scrape"], "true");
        assert_eq!(annotations[&format!("{PREFIX}/{fingerprint}")], "1");
        assert_eq!(annotations[&format!("{PREFIX}/node-exporter")], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_first_container_uses_whole_array() {
        let rule = InjectRule {
            containers: vec![sidecar("a", "busybox"), sidecar("b", "busybox")],
            ..Default::default()
        };
        let (engine, fingerprint) = engine_for(rule);
        let pod = PodBuilder::new("empty").build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let ops = ops_json(&outcome);
        assert_eq!(ops[0]["op"], "add");
        assert_eq!(ops[0]["path"], "/spec/containers");
        assert_eq!(ops[0]["value"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_existing_containers_get_appends() {
        let rule = InjectRule {
            containers: vec![sidecar("a", "busybox"), sidecar("b", "busybox")],
            ..Default::default()
        };
        let (engine, fingerprint) = engine_for(rule);
        let pod = PodBuilder::new("web").container("nginx").build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let ops = ops_json(&outcome);
        let container_ops: Vec<&Value> = ops
            .iter()
            .filter(|op| op["path"].as_str().unwrap().starts_with("/spec/containers"))
            .collect();
        assert_eq!(container_ops.len(), 2);
        for op in container_ops {
            assert_eq!(op["path"], "/spec/containers/-");
        }
    }

    #[test]
    fn test_mounts_reach_init_and_regular_containers() {
        let rule = InjectRule {
            volume_mounts: vec![mount("certs", "/etc/certs")],
            ..Default::default()
        };
        let (engine, fingerprint) = engine_for(rule);
        let pod = PodBuilder::new("web")
            .init_container("migrate")
            .container("nginx")
            .container_with_mounts("worker", &["/etc/certs"])
            .build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let patched = apply(&pod, outcome.patch().unwrap());
        let spec = patched.spec.as_ref().unwrap();

        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.volume_mounts.as_ref().unwrap()[0].mount_path, "/etc/certs");
        let nginx = &spec.containers[0];
        assert_eq!(nginx.volume_mounts.as_ref().unwrap()[0].name, "certs");

        // The colliding mount path keeps the pod's own mount
        let worker_mounts = spec.containers[1].volume_mounts.as_ref().unwrap();
        assert_eq!(worker_mounts.len(), 1);
        assert_eq!(worker_mounts[0].name, "data");
    }

    #[test]
    fn test_colliding_container_not_added_again() {
        let (engine, fingerprint) = engine_for(node_exporter_rule());
        let pod = PodBuilder::new("web").container("node-exporter").build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let ops = ops_json(&outcome);
        assert!(
            ops.iter().all(|op| !op["path"].as_str().unwrap().starts_with("/spec/containers")),
            "{ops:?}"
        );
    }

    #[test]
    fn test_second_admission_is_a_no_op() {
        let (engine, fingerprint) = engine_for(node_exporter_rule());
        let pod = PodBuilder::new("web").container("nginx").build();

        let first = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let patched = apply(&pod, first.patch().unwrap());

        let second = engine.mutate_at(&fingerprint, &patched, now()).unwrap();
        assert!(
            matches!(second, MutationOutcome::NothingToInject { ref rule } if rule == "node-exporter"),
            "{second:?}"
        );
    }

    #[test]
    fn test_reinvocation_adds_no_containers() {
        let mut rule = node_exporter_rule();
        rule.volume_mounts = vec![mount("host-root", "/host")];
        rule.max_iterations = 3;
        let (engine, fingerprint) = engine_for(rule);
        let pod = PodBuilder::new("web").container("nginx").build();

        let first = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let patched = apply(&pod, first.patch().unwrap());
        let second = engine.mutate_at(&fingerprint, &patched, now()).unwrap();

        if let Some(patch) = second.patch() {
            let value = serde_json::to_value(patch).unwrap();
            for op in value.as_array().unwrap() {
                let path = op["path"].as_str().unwrap();
                assert!(
                    path != "/spec/containers" && path != "/spec/containers/-",
                    "unexpected container add: {op}"
                );
            }
        }
    }

    #[test]
    fn test_counter_increments_from_existing_value() {
        let mut rule = node_exporter_rule();
        rule.max_iterations = 3;
        let (engine, fingerprint) = engine_for(rule);
        let pod = PodBuilder::new("web")
            .container("nginx")
            .annotation(format!("{PREFIX}/{fingerprint}"), "2")
            .build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let ops = ops_json(&outcome);
        let counter_path = format!(
            "/metadata/annotations/{}~1{}",
            PREFIX, fingerprint
        );
        let counter = ops.iter().find(|op| op["path"] == counter_path.as_str()).unwrap();
        assert_eq!(counter["op"], "replace");
        assert_eq!(counter["value"], "3");
    }

    #[test]
    fn test_absent_counter_starts_at_one() {
        let (engine, fingerprint) = engine_for(node_exporter_rule());
        let pod = PodBuilder::new("web")
            .container("nginx")
            .annotation("owner", "team-a")
            .build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let ops = ops_json(&outcome);
        let counter_path = format!("/metadata/annotations/{PREFIX}~1{fingerprint}");
        let counter = ops.iter().find(|op| op["path"] == counter_path.as_str()).unwrap();
        assert_eq!(counter["op"], "add");
        assert_eq!(counter["value"], "1");
    }

    #[test]
    fn test_unparsable_counter_reads_as_zero() {
        let (engine, fingerprint) = engine_for(node_exporter_rule());
        let pod = PodBuilder::new("web")
            .container("nginx")
            .annotation(format!("{PREFIX}/{fingerprint}"), "many")
            .build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let patched = apply(&pod, outcome.patch().unwrap());
        let annotations = patched.metadata.annotations.unwrap();
        assert_eq!(annotations[&format!("{PREFIX}/{fingerprint}")], "1");
    }

    #[test]
    fn test_limit_reached_blocks_patch() {
        let (engine, fingerprint) = engine_for(node_exporter_rule());
        let pod = PodBuilder::new("web")
            .container("nginx")
            .annotation(format!("{PREFIX}/{fingerprint}"), "1")
            .build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        assert!(
            matches!(outcome, MutationOutcome::IterationLimitReached { iterations: 1, .. }),
            "{outcome:?}"
        );
        assert!(outcome.patch().is_none());
    }

    #[test]
    fn test_existing_toleration_not_duplicated() {
        let (engine, fingerprint) = engine_for(node_exporter_rule());
        let pod = PodBuilder::new("web")
            .container("nginx")
            .toleration(Toleration {
                key: Some("dedicated".to_string()),
                operator: Some("Equal".to_string()),
                value: Some("monitoring".to_string()),
                effect: Some("NoSchedule".to_string()),
                toleration_seconds: None,
            })
            .build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let ops = ops_json(&outcome);
        assert!(
            ops.iter().all(|op| !op["path"].as_str().unwrap().starts_with("/spec/tolerations")),
            "{ops:?}"
        );
    }

    #[test]
    fn test_label_keys_are_escaped() {
        let rule = InjectRule {
            labels: [("app.kubernetes.io/part-of".to_string(), "mesh".to_string())].into(),
            ..Default::default()
        };
        let (engine, fingerprint) = engine_for(rule);
        let pod = PodBuilder::new("web").container("nginx").label("app", "web").build();

        let outcome = engine.mutate_at(&fingerprint, &pod, now()).unwrap();
        let ops = ops_json(&outcome);
        assert!(ops.contains(&json!({
            "op": "add",
            "path": "/metadata/labels/app.kubernetes.io~1part-of",
            "value": "mesh"
        })));
    }
}

mod cert_tests {
    use kube_sidecar_injector::cert::{CertError, CertificateAuthority};
    use x509_parser::pem::parse_x509_pem;

    fn hosts() -> Vec<String> {
        vec![
            "kube-sidecar-injector.default.svc".to_string(),
            "kube-sidecar-injector.default.svc.cluster.local".to_string(),
        ]
    }

    #[test]
    fn test_empty_hosts_rejected() {
        let err = CertificateAuthority::new("flashbots.net", Vec::new()).err().unwrap();
        assert!(matches!(err, CertError::UnspecifiedHosts));
    }

    #[test]
    fn test_leaf_is_signed_by_returned_ca() {
        let ca = CertificateAuthority::new("flashbots.net", hosts()).unwrap();
        let bundle = ca.issue_leaf().unwrap();

        let (_, ca_pem) = parse_x509_pem(bundle.ca_pem().as_bytes()).unwrap();
        let ca_cert = ca_pem.parse_x509().unwrap();
        let (_, leaf_pem) = parse_x509_pem(bundle.cert_pem().as_bytes()).unwrap();
        let leaf = leaf_pem.parse_x509().unwrap();

        assert!(ca_cert.is_ca());
        assert!(!leaf.is_ca());
        leaf.verify_signature(Some(ca_cert.public_key())).unwrap();
        assert!(bundle.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn test_leaves_share_ca_until_regenerated() {
        let ca = CertificateAuthority::new("flashbots.net", hosts()).unwrap();
        let first = ca.issue_leaf().unwrap();
        let second = ca.issue_leaf().unwrap();
        assert_eq!(first.ca_pem(), second.ca_pem());
        assert_ne!(first.cert_pem(), second.cert_pem());

        let regenerated = ca.regenerate_ca().unwrap();
        let third = ca.issue_leaf().unwrap();
        assert_ne!(first.ca_pem(), regenerated);
        assert_eq!(third.ca_pem(), regenerated);
    }
}
