//! Registration of the injector with the API server.
//!
//! At startup the injector writes a `MutatingWebhookConfiguration` holding
//! one webhook per rule. Each webhook points at `<pathWebhook>/<fingerprint>`
//! on the injector's service, carries the rule's pod and namespace selectors,
//! and trusts the CA generated for this process. The object is created if
//! missing and otherwise replaced wholesale, so webhooks of rules that were
//! removed from configuration disappear on the next start.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::PostParams;
use thiserror::Error;
use tracing::info;

use crate::config::{K8sConfig, ServerConfig};
use crate::rules::{RuleError, RuleRegistry, ToCluster};

/// Errors raised while registering the webhook
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid selector in rule {rule}: {source}")]
    Selector {
        rule: String,
        #[source]
        source: RuleError,
    },

    #[error("failed to upsert mutating webhook configuration {name}: {source}")]
    FailedToUpsert {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("timed out upserting mutating webhook configuration {name}")]
    Timeout { name: String },
}

/// Storage for `MutatingWebhookConfiguration` objects.
///
/// Implemented for the cluster API; tests use an in-memory store.
#[async_trait]
pub trait WebhookConfigurationStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, name: &str) -> Result<Option<MutatingWebhookConfiguration>, Self::Error>;

    async fn create(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, Self::Error>;

    async fn replace(
        &self,
        name: &str,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, Self::Error>;
}

#[async_trait]
impl WebhookConfigurationStore for Api<MutatingWebhookConfiguration> {
    type Error = kube::Error;

    async fn get(&self, name: &str) -> Result<Option<MutatingWebhookConfiguration>, kube::Error> {
        self.get_opt(name).await
    }

    async fn create(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, kube::Error> {
        Api::create(self, &PostParams::default(), config).await
    }

    async fn replace(
        &self,
        name: &str,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, kube::Error> {
        Api::replace(self, name, &PostParams::default(), config).await
    }
}

/// What the reconciler did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Replaced,
}

/// Everything needed to describe the injector's webhook configuration.
pub struct WebhookRegistration<'a> {
    pub registry: &'a RuleRegistry,
    pub k8s: &'a K8sConfig,
    pub server: &'a ServerConfig,
    /// PEM encoded CA certificate the API server should trust.
    pub ca_bundle: &'a str,
}

impl WebhookRegistration<'_> {
    /// Webhook name for one rule: `<fingerprint>.<configuration name>.<org domain>`.
    pub fn webhook_name(&self, fingerprint: &str) -> String {
        format!(
            "{}.{}.{}",
            fingerprint, self.k8s.mutating_webhook_configuration_name, self.k8s.org_domain
        )
    }

    /// The configuration object as it should exist in the cluster.
    pub fn desired(&self) -> Result<MutatingWebhookConfiguration, RegistrationError> {
        let webhooks = self
            .registry
            .iter()
            .map(|registered| {
                let rule = registered.rule();
                let selector_error = |source| RegistrationError::Selector {
                    rule: registered.display_name(),
                    source,
                };
                let object_selector = rule
                    .label_selector
                    .as_ref()
                    .map(ToCluster::to_cluster)
                    .transpose()
                    .map_err(selector_error)?;
                let namespace_selector = rule
                    .namespace_selector
                    .as_ref()
                    .map(ToCluster::to_cluster)
                    .transpose()
                    .map_err(selector_error)?;

                Ok(MutatingWebhook {
                    name: self.webhook_name(registered.fingerprint()),
                    admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
                    client_config: WebhookClientConfig {
                        ca_bundle: Some(ByteString(self.ca_bundle.as_bytes().to_vec())),
                        service: Some(ServiceReference {
                            name: self.k8s.service_name.clone(),
                            namespace: self.k8s.namespace.clone(),
                            path: Some(self.server.webhook_path(registered.fingerprint())),
                            port: Some(i32::from(self.k8s.service_port_number)),
                        }),
                        url: None,
                    },
                    failure_policy: Some("Ignore".to_string()),
                    reinvocation_policy: Some("IfNeeded".to_string()),
                    side_effects: "None".to_string(),
                    object_selector,
                    namespace_selector,
                    rules: Some(vec![RuleWithOperations {
                        api_groups: Some(vec![String::new()]),
                        api_versions: Some(vec!["v1".to_string()]),
                        operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
                        resources: Some(vec!["pods".to_string()]),
                        scope: None,
                    }]),
                    ..Default::default()
                })
            })
            .collect::<Result<Vec<_>, RegistrationError>>()?;

        Ok(MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(self.k8s.mutating_webhook_configuration_name.clone()),
                ..Default::default()
            },
            webhooks: Some(webhooks),
        })
    }

    /// Create the configuration, or replace it if it already exists.
    pub async fn reconcile<S: WebhookConfigurationStore>(
        &self,
        store: &S,
    ) -> Result<UpsertAction, RegistrationError> {
        let name = self.k8s.mutating_webhook_configuration_name.clone();
        let mut desired = self.desired()?;
        let upsert_error = |e: S::Error| RegistrationError::FailedToUpsert {
            name: name.clone(),
            source: Box::new(e),
        };

        match store.get(&name).await.map_err(upsert_error)? {
            None => {
                store.create(&desired).await.map_err(upsert_error)?;
                info!(name = %name, webhooks = self.registry.len(), "Created mutating webhook configuration");
                Ok(UpsertAction::Created)
            }
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                store.replace(&name, &desired).await.map_err(upsert_error)?;
                info!(name = %name, webhooks = self.registry.len(), "Updated mutating webhook configuration");
                Ok(UpsertAction::Replaced)
            }
        }
    }
}
