//! Webhook serving and registration.
//!
//! - [`server`]: the HTTPS endpoint the API server calls with admission reviews
//! - [`registration`]: the `MutatingWebhookConfiguration` that routes pods to it

pub mod registration;
mod server;

pub use registration::{
    RegistrationError, UpsertAction, WebhookConfigurationStore, WebhookRegistration,
};
pub use server::{
    SHUTDOWN_GRACE_PERIOD, WebhookError, WebhookState, create_webhook_router, run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
