//! nsm-admission-webhook library crate
//!
//! Mutating admission webhook that injects Network Service Mesh sidecars,
//! volumes, env vars and labels into annotated workloads.

pub mod config;
pub mod health;
pub mod registration;
pub mod tls;
pub mod webhooks;

pub use config::{Config, ConfigResolver, WebhookMode};
pub use health::HealthState;
pub use webhooks::{Reviewer, WebhookError, WebhookState, run_webhook_server};

use std::sync::Arc;

use axum_server::Handle;
use rustls::ServerConfig;
use tracing::{info, warn};

use tls::workload_api::WORKLOAD_API_STARTUP_TIMEOUT;
use tls::{ServingCertificate, SvidFileSource, WorkloadApiSource};

/// Build the TLS configuration for the admission listener.
///
/// Locally held certificates are served as is. In spire mode the X.509 SVID
/// is served per handshake, read from the SPIRE helper's files when a
/// directory is configured and from the Workload API otherwise.
pub async fn serving_tls_config(
    resolver: &ConfigResolver,
) -> Result<Arc<ServerConfig>, WebhookError> {
    let certificate = resolver
        .certificate()
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    match certificate {
        ServingCertificate::Provided { cert_pem, key_pem }
        | ServingCertificate::SelfSigned { cert_pem, key_pem } => {
            Ok(tls::server_config(cert_pem, key_pem)?)
        }
        ServingCertificate::External => match &resolver.config().svid_dir {
            Some(dir) if !dir.as_os_str().is_empty() => {
                let source = SvidFileSource::load(dir)?;
                Ok(tls::server_config_with_resolver(Arc::new(source))?)
            }
            _ => {
                let source = WorkloadApiSource::connect(WORKLOAD_API_STARTUP_TIMEOUT).await?;
                Ok(tls::server_config_with_resolver(Arc::new(source))?)
            }
        },
    }
}

/// Flip readiness once the admission listener is bound.
pub async fn mark_ready_when_listening(handle: Handle, health_state: Arc<HealthState>) {
    match handle.listening().await {
        Some(addr) => {
            info!(addr = %addr, "Admission endpoint is accepting connections");
            health_state.set_ready(true).await;
        }
        None => warn!("Admission endpoint failed to bind"),
    }
}
