//! Process configuration.
//!
//! Every setting can be supplied as a command line flag or through an
//! `NSM_*` environment variable. Values are read once at startup and never
//! change afterwards; derived values (sidecar environment, serving
//! certificate, CA bundle) are computed by [`ConfigResolver`].

mod resolve;

pub use resolve::{ConfigResolver, ResolveError, Resolved};

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::Parser;
use regex::Regex;
use thiserror::Error;

use crate::webhooks::mutation::{SidecarResources, SidecarSpec};

/// Errors raised while validating configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("not a valid webhook mode: {0}")]
    InvalidMode(String),

    #[error("invalid label entry '{0}', expected key:value")]
    InvalidLabel(String),

    #[error("invalid env entry '{0}', expected KEY=VALUE")]
    InvalidEnv(String),

    #[error("invalid quantity '{value}' for {field}")]
    InvalidQuantity { field: &'static str, value: String },
}

/// How the webhook obtains its serving certificate and registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookMode {
    /// Certificates come from SPIRE and the webhook configuration is
    /// applied by the operator.
    #[default]
    Spire,
    /// The webhook generates its own certificate and publishes its own
    /// `MutatingWebhookConfiguration`.
    SelfRegister,
}

impl FromStr for WebhookMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spire" => Ok(WebhookMode::Spire),
            "selfregister" => Ok(WebhookMode::SelfRegister),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for WebhookMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookMode::Spire => write!(f, "spire"),
            WebhookMode::SelfRegister => write!(f, "selfregister"),
        }
    }
}

/// nsm-admission-webhook - injects Network Service Mesh sidecars into workloads
#[derive(Parser, Debug, Clone)]
#[command(name = "nsm-admission-webhook", version, about, long_about = None)]
pub struct Config {
    /// Name of current admission webhook instance
    #[arg(long, env = "NSM_NAME", default_value = "admission-webhook-k8s")]
    pub name: String,

    /// Name of the service that fronts this admission webhook instance
    #[arg(long, env = "NSM_SERVICE_NAME", default_value = "default")]
    pub service_name: String,

    /// Namespace where the admission webhook is deployed
    #[arg(long, env = "NSM_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Annotation that marks a resource for sidecar injection
    #[arg(long, env = "NSM_ANNOTATION", default_value = "networkservicemesh.io")]
    pub annotation: String,

    /// Labels appended to every injected workload (key:value,key:value)
    #[arg(long, env = "NSM_LABELS", value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Name of the env variable that carries the network service URLs
    #[arg(long, env = "NSM_NSURL_ENV_NAME", default_value = "NSM_NETWORK_SERVICES")]
    pub nsurl_env_name: String,

    /// Init container images appended to every injected workload
    #[arg(long, env = "NSM_INIT_CONTAINER_IMAGES", value_delimiter = ',')]
    pub init_container_images: Vec<String>,

    /// Container images appended to every injected workload
    #[arg(long, env = "NSM_CONTAINER_IMAGES", value_delimiter = ',')]
    pub container_images: Vec<String>,

    /// Additional KEY=VALUE env variables for every injected container
    #[arg(long, env = "NSM_ENVS", value_delimiter = ',')]
    pub envs: Vec<String>,

    /// Webhook mode: 'spire' or 'selfregister'
    #[arg(long, env = "NSM_WEBHOOK_MODE", default_value = "spire", value_parser = WebhookMode::from_str)]
    pub webhook_mode: WebhookMode,

    /// Path to the serving certificate. Preferred when set together with the key path
    #[arg(long, env = "NSM_CERT_FILE_PATH")]
    pub cert_file_path: Option<PathBuf>,

    /// Path to the private key for the serving certificate
    #[arg(long, env = "NSM_KEY_FILE_PATH")]
    pub key_file_path: Option<PathBuf>,

    /// Path to the CA bundle published with the webhook registration
    #[arg(long, env = "NSM_CA_BUNDLE_FILE_PATH")]
    pub ca_bundle_file_path: Option<PathBuf>,

    /// Directory where the SPIRE helper keeps the X.509 SVID. When unset,
    /// spire mode reads the SVID from the Workload API at SPIFFE_ENDPOINT_SOCKET
    #[arg(long, env = "NSM_SVID_DIR")]
    pub svid_dir: Option<PathBuf>,

    /// Memory limit for injected sidecars
    #[arg(long, env = "NSM_SIDECAR_LIMITS_MEMORY", default_value = "80Mi")]
    pub sidecar_limits_memory: String,

    /// CPU limit for injected sidecars
    #[arg(long, env = "NSM_SIDECAR_LIMITS_CPU", default_value = "200m")]
    pub sidecar_limits_cpu: String,

    /// Memory request for injected sidecars
    #[arg(long, env = "NSM_SIDECAR_REQUESTS_MEMORY", default_value = "40Mi")]
    pub sidecar_requests_memory: String,

    /// CPU request for injected sidecars
    #[arg(long, env = "NSM_SIDECAR_REQUESTS_CPU", default_value = "100m")]
    pub sidecar_requests_cpu: String,

    /// Address of the TLS admission endpoint
    #[arg(long, env = "NSM_LISTEN_ON", default_value = "0.0.0.0:443")]
    pub listen_on: SocketAddr,

    /// Address of the health and metrics endpoint
    #[arg(long, env = "NSM_HEALTH_LISTEN_ON", default_value = "0.0.0.0:8080")]
    pub health_listen_on: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["nsm-admission-webhook"])
    }
}

impl Config {
    /// Whether operator supplied certificate files should be used.
    pub fn uses_existing_certificates(&self) -> bool {
        let set = |p: &Option<PathBuf>| p.as_ref().is_some_and(|p| !p.as_os_str().is_empty());
        set(&self.cert_file_path) && set(&self.key_file_path)
    }

    /// Parse the configured label entries into a map.
    pub fn labels(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        non_empty(&self.labels)
            .map(|entry| {
                entry
                    .split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .filter(|(k, _)| !k.is_empty())
                    .ok_or_else(|| ConfigError::InvalidLabel(entry.to_string()))
            })
            .collect()
    }

    /// Build the static sidecar description injected into every workload.
    pub fn sidecar_spec(&self) -> Result<SidecarSpec, ConfigError> {
        Ok(SidecarSpec {
            init_container_images: non_empty(&self.init_container_images)
                .map(str::to_string)
                .collect(),
            container_images: non_empty(&self.container_images)
                .map(str::to_string)
                .collect(),
            labels: self.labels()?,
            resources: SidecarResources {
                limits_cpu: quantity("sidecar limits cpu", &self.sidecar_limits_cpu)?,
                limits_memory: quantity("sidecar limits memory", &self.sidecar_limits_memory)?,
                requests_cpu: quantity("sidecar requests cpu", &self.sidecar_requests_cpu)?,
                requests_memory: quantity(
                    "sidecar requests memory",
                    &self.sidecar_requests_memory,
                )?,
            },
        })
    }

    /// Validate every derived setting so misconfiguration fails at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sidecar_spec()?;
        crate::webhooks::mutation::static_env(&self.envs)?;
        Ok(())
    }
}

/// Iterate over trimmed, non-empty list entries.
pub(crate) fn non_empty(entries: &[String]) -> impl Iterator<Item = &str> {
    entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty())
}

static QUANTITY_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+|Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E)?$")
        .ok()
});

/// Check a Kubernetes resource quantity such as `100m` or `40Mi`.
pub fn quantity(field: &'static str, value: &str) -> Result<String, ConfigError> {
    let value = value.trim();
    if QUANTITY_REGEX
        .as_ref()
        .is_some_and(|re| re.is_match(value))
    {
        Ok(value.to_string())
    } else {
        Err(ConfigError::InvalidQuantity {
            field,
            value: value.to_string(),
        })
    }
}
