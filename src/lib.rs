//! kube-sidecar-injector library crate
//!
//! A mutating admission webhook that injects containers, volumes, mounts,
//! metadata, node affinity and tolerations into pods according to
//! declarative rules.
//!
//! - [`rules`]: rule types, fingerprints and the rule registry
//! - [`patch`]: JSON Patch construction
//! - [`mutation`]: the per-request mutation engine and circuit breaker
//! - [`cert`]: the self-signed CA that secures the webhook endpoint
//! - [`webhooks`]: the HTTPS admission server and webhook registration
//! - [`config`], [`health`]: configuration, probes and metrics

pub mod cert;
pub mod config;
pub mod error;
pub mod health;
pub mod mutation;
pub mod patch;
pub mod rules;
pub mod webhooks;

pub use error::{Error, Result};
pub use health::HealthState;
pub use mutation::{MutationEngine, MutationOutcome};
pub use rules::{InjectRule, RuleRegistry};
pub use webhooks::{WebhookError, WebhookState, run_webhook_server};

/// Application name, used for defaults and log filtering
pub const APP_NAME: &str = "kube-sidecar-injector";
