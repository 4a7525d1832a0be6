//! Self-registration of the webhook in `selfregister` mode.
//!
//! The `MutatingWebhookConfiguration` is applied at startup with the
//! resolved CA bundle and removed again at shutdown.

use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::webhooks::WorkloadKind;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "nsm-admission-webhook";

/// Path of the mutating endpoint
pub const MUTATE_PATH: &str = "/mutate";

/// Errors raised while publishing the webhook configuration.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("a CA bundle is required to register the webhook")]
    MissingCaBundle,

    #[error("failed to apply MutatingWebhookConfiguration {name}: {source}")]
    Apply {
        name: String,
        #[source]
        source: kube::Error,
    },
}

fn rule(api_group: &str, api_version: &str, kinds: &[WorkloadKind]) -> RuleWithOperations {
    RuleWithOperations {
        operations: Some(vec!["CREATE".to_string()]),
        api_groups: Some(vec![api_group.to_string()]),
        api_versions: Some(vec![api_version.to_string()]),
        resources: Some(kinds.iter().map(|k| k.plural().to_string()).collect()),
        ..Default::default()
    }
}

/// The webhook configuration pointing the API server at this instance.
pub fn webhook_configuration(config: &Config, ca_bundle: &[u8]) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: format!("{}.networkservicemesh.io", config.name),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Ignore".to_string()),
            rules: Some(vec![
                rule("", "v1", &[WorkloadKind::Pod]),
                rule(
                    "apps",
                    "v1",
                    &[
                        WorkloadKind::Deployment,
                        WorkloadKind::DaemonSet,
                        WorkloadKind::StatefulSet,
                        WorkloadKind::ReplicaSet,
                    ],
                ),
            ]),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: config.service_name.clone(),
                    namespace: config.namespace.clone(),
                    path: Some(MUTATE_PATH.to_string()),
                    ..Default::default()
                }),
                ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                ..Default::default()
            },
            ..Default::default()
        }]),
    }
}

/// A published webhook configuration that must be removed at shutdown.
pub struct Registration {
    api: Api<MutatingWebhookConfiguration>,
    name: String,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the webhook configuration. Failures are logged only.
    pub async fn unregister(self) {
        match self.api.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => info!(name = %self.name, "Unregistered MutatingWebhookConfiguration"),
            Err(e) => warn!(
                name = %self.name,
                error = %e,
                "Failed to delete MutatingWebhookConfiguration"
            ),
        }
    }
}

/// Publish the webhook configuration.
pub async fn register(
    client: Client,
    config: &Config,
    ca_bundle: Option<&[u8]>,
) -> Result<Registration, RegistrationError> {
    let ca_bundle = ca_bundle.ok_or(RegistrationError::MissingCaBundle)?;
    let webhook_config = webhook_configuration(config, ca_bundle);

    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&config.name, &params, &Patch::Apply(&webhook_config))
        .await
        .map_err(|source| RegistrationError::Apply {
            name: config.name.clone(),
            source,
        })?;

    info!(name = %config.name, "Registered MutatingWebhookConfiguration");
    Ok(Registration {
        api,
        name: config.name.clone(),
    })
}
