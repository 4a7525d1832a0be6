//! One-time resolution of values derived from [`Config`].
//!
//! The sidecar environment, the serving certificate and the CA bundle are
//! computed on first use and then shared for the lifetime of the process.
//! Concurrent first callers block until the single resolution pass has
//! finished and then all observe the same result.

use std::sync::{Arc, OnceLock};

use k8s_openapi::api::core::v1::EnvVar;
use thiserror::Error;
use tracing::info;

use super::{Config, ConfigError, WebhookMode};
use crate::tls::{self, ServingCertificate, TlsError};
use crate::webhooks::mutation;

/// Failure of the one-time resolution pass. Always fatal at startup.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Values derived from the configuration.
#[derive(Debug)]
pub struct Resolved {
    /// Static env vars shared by every injected container.
    pub envs: Vec<EnvVar>,
    /// TLS material for the admission endpoint.
    pub certificate: ServingCertificate,
    /// CA bundle to publish with the webhook registration (selfregister only).
    pub ca_bundle: Option<Vec<u8>>,
}

/// Owns the configuration and its lazily resolved derived values.
#[derive(Debug)]
pub struct ConfigResolver {
    config: Arc<Config>,
    resolved: OnceLock<Result<Resolved, ResolveError>>,
}

impl ConfigResolver {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            resolved: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve every derived value, running the resolution at most once.
    pub fn resolve(&self) -> Result<&Resolved, ResolveError> {
        self.resolved
            .get_or_init(|| Self::initialize(&self.config))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Sidecar env vars derived from the configured extras.
    pub fn envs(&self) -> Result<&[EnvVar], ResolveError> {
        self.resolve().map(|r| r.envs.as_slice())
    }

    /// CA bundle bytes; `None` outside selfregister mode.
    pub fn ca_bundle(&self) -> Result<Option<&[u8]>, ResolveError> {
        self.resolve().map(|r| r.ca_bundle.as_deref())
    }

    /// The serving certificate for the admission endpoint.
    pub fn certificate(&self) -> Result<&ServingCertificate, ResolveError> {
        self.resolve().map(|r| &r.certificate)
    }

    fn initialize(config: &Config) -> Result<Resolved, ResolveError> {
        let envs = mutation::static_env(&config.envs)?;
        let certificate = tls::resolve_certificate(config)?;
        let ca_bundle = resolve_ca_bundle(config, &certificate)?;

        info!(
            mode = %config.webhook_mode,
            certificate = certificate.source(),
            envs = envs.len(),
            ca_bundle = ca_bundle.is_some(),
            "Resolved derived configuration"
        );

        Ok(Resolved {
            envs,
            certificate,
            ca_bundle,
        })
    }
}

/// The CA bundle is only needed when the webhook registers itself. A
/// self-signed certificate doubles as its own bundle; otherwise the bundle
/// must come from the configured file.
fn resolve_ca_bundle(
    config: &Config,
    certificate: &ServingCertificate,
) -> Result<Option<Vec<u8>>, TlsError> {
    if config.webhook_mode != WebhookMode::SelfRegister {
        return Ok(None);
    }

    if let Some(bundle) = certificate.ca_bundle() {
        return Ok(Some(bundle.to_vec()));
    }

    let path = config
        .ca_bundle_file_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or(TlsError::MissingCaBundle)?;

    tls::read_file(path).map(Some)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::thread;

    fn selfregister_config() -> Config {
        Config {
            webhook_mode: WebhookMode::SelfRegister,
            service_name: "nsm-admission-webhook-svc".to_string(),
            namespace: "nsm-system".to_string(),
            envs: vec!["LOG_LEVEL=DEBUG".to_string(), "NSM_DIAL_TIMEOUT=5s".to_string()],
            ..Config::default()
        }
    }

    #[test]
    fn test_spire_mode_has_no_local_certificate() {
        let resolver = ConfigResolver::new(Arc::new(Config::default()));
        let resolved = resolver.resolve().unwrap();
        assert!(matches!(resolved.certificate, ServingCertificate::External));
        assert!(resolved.ca_bundle.is_none());
    }

    #[test]
    fn test_selfregister_ca_bundle_is_certificate() {
        let resolver = ConfigResolver::new(Arc::new(selfregister_config()));
        let cert_pem = match resolver.certificate().unwrap() {
            ServingCertificate::SelfSigned { cert_pem, .. } => cert_pem.clone(),
            other => panic!("expected self-signed certificate, got {other:?}"),
        };
        assert_eq!(resolver.ca_bundle().unwrap(), Some(cert_pem.as_slice()));
    }

    #[test]
    fn test_envs_include_bootstrap_variables() {
        let resolver = ConfigResolver::new(Arc::new(selfregister_config()));
        let names: Vec<_> = resolver
            .envs()
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "LOG_LEVEL",
                "NSM_DIAL_TIMEOUT",
                "SPIFFE_ENDPOINT_SOCKET",
                "POD_NAME"
            ]
        );
    }

    #[test]
    fn test_missing_certificate_files_are_fatal() {
        let config = Config {
            cert_file_path: Some(PathBuf::from("/nonexistent/tls.crt")),
            key_file_path: Some(PathBuf::from("/nonexistent/tls.key")),
            ..Config::default()
        };
        let resolver = ConfigResolver::new(Arc::new(config));
        assert!(matches!(
            resolver.resolve(),
            Err(ResolveError::Tls(TlsError::Read { .. }))
        ));
        // The failure is memoized as well
        assert!(resolver.certificate().is_err());
    }

    #[test]
    fn test_missing_ca_bundle_file_is_fatal() {
        let config = Config {
            ca_bundle_file_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            ..Config::default()
        };
        // Provided certificates in selfregister mode require a bundle file
        let dir = std::env::temp_dir().join(format!("nsm-resolve-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let generated = tls::self_signed_certificate("svc", "ns").unwrap();
        let (cert_pem, key_pem) = generated.pem_pair().unwrap();
        std::fs::write(dir.join("tls.crt"), cert_pem).unwrap();
        std::fs::write(dir.join("tls.key"), key_pem).unwrap();

        let config = Config {
            webhook_mode: WebhookMode::SelfRegister,
            cert_file_path: Some(dir.join("tls.crt")),
            key_file_path: Some(dir.join("tls.key")),
            ..config
        };
        let resolver = ConfigResolver::new(Arc::new(config));
        assert!(matches!(
            resolver.resolve(),
            Err(ResolveError::Tls(TlsError::Read { .. }))
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_env_entry_is_fatal() {
        let config = Config {
            envs: vec!["BROKEN".to_string()],
            ..Config::default()
        };
        let resolver = ConfigResolver::new(Arc::new(config));
        assert!(matches!(
            resolver.envs(),
            Err(ResolveError::Config(ConfigError::InvalidEnv(_)))
        ));
    }

    #[test]
    fn test_concurrent_callers_observe_single_resolution() {
        let resolver = Arc::new(ConfigResolver::new(Arc::new(selfregister_config())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                thread::spawn(move || {
                    let cert = match resolver.certificate().unwrap() {
                        ServingCertificate::SelfSigned { cert_pem, .. } => cert_pem.clone(),
                        other => panic!("unexpected certificate {other:?}"),
                    };
                    let envs_ptr = resolver.envs().unwrap().as_ptr() as usize;
                    (cert, envs_ptr)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (first_cert, first_envs) = &results[0];
        for (cert, envs) in &results {
            // Every generation produces a fresh key, so identical PEM means one pass
            assert_eq!(cert, first_cert);
            assert_eq!(envs, first_envs);
        }
    }
}
