//! Serving certificate resolution for the admission endpoint.
//!
//! The certificate comes from one of three places, in priority order:
//! 1. Operator supplied certificate and key files
//! 2. The SPIRE issued X.509 SVID (spire mode), served per handshake from
//!    the Workload API or from files kept by the SPIRE helper
//! 3. An in-memory self-signed certificate (selfregister mode)

pub mod identity;
pub mod workload_api;

pub use identity::SvidFileSource;
pub use workload_api::WorkloadApiSource;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, string::Ia5String,
};
use rustls::crypto::aws_lc_rs;
use rustls::{ConfigBuilder, ServerConfig, WantsVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::config::{Config, WebhookMode};

/// Validity of the self-signed certificate
pub const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Errors produced while resolving TLS material.
#[derive(Error, Debug, Clone)]
pub enum TlsError {
    #[error("failed to read {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("invalid PEM data: {0}")]
    Pem(String),

    #[error("no certificates found in PEM data")]
    NoCertificates,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("invalid TLS key pair: {0}")]
    KeyPair(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("a CA bundle file is required in selfregister mode when certificate files are used")]
    MissingCaBundle,

    #[error("external identity source unavailable: {0}")]
    IdentitySource(String),
}

/// TLS material for the admission endpoint.
#[derive(Clone)]
pub enum ServingCertificate {
    /// Loaded from operator supplied files
    Provided { cert_pem: Vec<u8>, key_pem: Vec<u8> },
    /// Generated in memory at startup; the certificate is its own CA bundle
    SelfSigned { cert_pem: Vec<u8>, key_pem: Vec<u8> },
    /// Obtained per handshake from the external identity source
    External,
}

impl std::fmt::Debug for ServingCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        write!(f, "ServingCertificate({})", self.source())
    }
}

impl ServingCertificate {
    /// Short name of where the certificate came from, for logging.
    pub fn source(&self) -> &'static str {
        match self {
            ServingCertificate::Provided { .. } => "provided",
            ServingCertificate::SelfSigned { .. } => "self-signed",
            ServingCertificate::External => "external",
        }
    }

    /// PEM encoded certificate and key, when held locally.
    pub fn pem_pair(&self) -> Option<(&[u8], &[u8])> {
        match self {
            ServingCertificate::Provided { cert_pem, key_pem }
            | ServingCertificate::SelfSigned { cert_pem, key_pem } => {
                Some((cert_pem.as_slice(), key_pem.as_slice()))
            }
            ServingCertificate::External => None,
        }
    }

    /// The CA bundle implied by the certificate itself.
    pub fn ca_bundle(&self) -> Option<&[u8]> {
        match self {
            ServingCertificate::SelfSigned { cert_pem, .. } => Some(cert_pem),
            _ => None,
        }
    }
}

/// Resolve the serving certificate according to the configuration.
pub fn resolve_certificate(config: &Config) -> Result<ServingCertificate, TlsError> {
    if config.uses_existing_certificates() {
        if let (Some(cert_path), Some(key_path)) = (&config.cert_file_path, &config.key_file_path)
        {
            return load_key_pair(cert_path, key_path);
        }
    }

    match config.webhook_mode {
        WebhookMode::Spire => Ok(ServingCertificate::External),
        WebhookMode::SelfRegister => {
            self_signed_certificate(&config.service_name, &config.namespace)
        }
    }
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|e| TlsError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load and validate a certificate/key pair from disk.
pub fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<ServingCertificate, TlsError> {
    let cert_pem = read_file(cert_path)?;
    let key_pem = read_file(key_path)?;
    // Rejects a key that does not belong to the leaf certificate
    server_config(&cert_pem, &key_pem)?;

    info!(cert = %cert_path.display(), "Loaded serving certificate from files");
    Ok(ServingCertificate::Provided { cert_pem, key_pem })
}

/// Parse a PEM certificate chain and private key.
pub fn parse_key_pair(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let certs = rustls_pemfile::certs(&mut &*cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }

    let key = rustls_pemfile::private_key(&mut &*key_pem)
        .map_err(|e| TlsError::Pem(e.to_string()))?
        .ok_or(TlsError::NoPrivateKey)?;

    Ok((certs, key))
}

/// In-cluster DNS names of the webhook service.
pub fn service_dns_names(service_name: &str, namespace: &str) -> Vec<String> {
    vec![
        format!("{}.{}", service_name, namespace),
        format!("{}.{}.svc", service_name, namespace),
    ]
}

/// Generate a self-signed, CA-flagged certificate valid for one year.
pub fn self_signed_certificate(
    service_name: &str,
    namespace: &str,
) -> Result<ServingCertificate, TlsError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(format!("networkservicemesh.{}-ca", service_name)),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(SELF_SIGNED_VALIDITY_DAYS);

    params.subject_alt_names = service_dns_names(service_name, namespace)
        .into_iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| TlsError::Generation(format!("invalid DNS name '{}': {}", name, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let key_pair = KeyPair::generate()
        .map_err(|e| TlsError::Generation(format!("failed to generate key: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::Generation(format!("failed to self-sign certificate: {}", e)))?;

    let cert_pem = cert.pem().into_bytes();
    let key_pem = key_pair.serialize_pem().into_bytes();

    // The pair must be usable by the TLS stack before we hand it out
    parse_key_pair(&cert_pem, &key_pem)?;

    info!(
        service = %service_name,
        namespace = %namespace,
        "Generated self-signed serving certificate"
    );
    Ok(ServingCertificate::SelfSigned { cert_pem, key_pem })
}

/// Pair a certificate chain with its signing key for per-handshake use.
pub(crate) fn signing_pair(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let signing_key =
        aws_lc_rs::sign::any_supported_type(&key).map_err(|e| TlsError::KeyPair(e.to_string()))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn builder() -> Result<ConfigBuilder<ServerConfig, WantsVerifier>, TlsError> {
    ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::KeyPair(e.to_string()))
}

fn with_alpn(mut config: ServerConfig) -> Arc<ServerConfig> {
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Build a rustls server configuration from a PEM certificate and key.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>, TlsError> {
    let (certs, key) = parse_key_pair(cert_pem, key_pem)?;
    let config = builder()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::KeyPair(e.to_string()))?;
    Ok(with_alpn(config))
}

/// Build a rustls server configuration that asks `resolver` for the
/// certificate on every handshake.
pub fn server_config_with_resolver(
    resolver: Arc<dyn ResolvesServerCert>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let config = builder()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    Ok(with_alpn(config))
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
    use x509_parser::prelude::*;

    #[test]
    fn test_service_dns_names() {
        assert_eq!(
            service_dns_names("nsm-webhook", "nsm-system"),
            vec!["nsm-webhook.nsm-system", "nsm-webhook.nsm-system.svc"]
        );
    }

    #[test]
    fn test_self_signed_certificate_sans() {
        let cert = self_signed_certificate("nsm-webhook", "nsm-system").unwrap();
        let (cert_pem, _) = cert.pem_pair().unwrap();

        let (_, pem) = parse_x509_pem(cert_pem).unwrap();
        let parsed = pem.parse_x509().unwrap();

        let san = parsed
            .subject_alternative_name()
            .unwrap()
            .expect("certificate should carry SANs");
        let names: Vec<&str> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(name) => Some(*name),
                _ => None,
            })
            .collect();

        assert!(names.contains(&"nsm-webhook.nsm-system"));
        assert!(names.contains(&"nsm-webhook.nsm-system.svc"));
        assert!(parsed.is_ca());
    }

    #[test]
    fn test_self_signed_certificate_validity() {
        let cert = self_signed_certificate("svc", "ns").unwrap();
        let (cert_pem, _) = cert.pem_pair().unwrap();
        let (_, pem) = parse_x509_pem(cert_pem).unwrap();
        let parsed = pem.parse_x509().unwrap();

        let lifetime = parsed.validity().not_after.timestamp()
            - parsed.validity().not_before.timestamp();
        assert_eq!(lifetime, SELF_SIGNED_VALIDITY_DAYS * 24 * 60 * 60);
    }

    #[test]
    fn test_self_signed_key_pair_is_loadable() {
        let cert = self_signed_certificate("svc", "ns").unwrap();
        let (cert_pem, key_pem) = cert.pem_pair().unwrap();
        assert!(server_config(cert_pem, key_pem).is_ok());
    }

    #[test]
    fn test_self_signed_ca_bundle_is_certificate_pem() {
        let cert = self_signed_certificate("svc", "ns").unwrap();
        let (cert_pem, _) = cert.pem_pair().unwrap();
        assert_eq!(cert.ca_bundle(), Some(cert_pem));
        assert!(
            String::from_utf8_lossy(cert_pem).starts_with("-----BEGIN CERTIFICATE-----")
        );
    }

    #[test]
    fn test_each_generation_uses_fresh_key() {
        let a = self_signed_certificate("svc", "ns").unwrap();
        let b = self_signed_certificate("svc", "ns").unwrap();
        assert_ne!(a.pem_pair().unwrap().1, b.pem_pair().unwrap().1);
    }

    #[test]
    fn test_parse_key_pair_rejects_garbage() {
        assert!(matches!(
            parse_key_pair(b"not a pem", b"not a pem"),
            Err(TlsError::NoCertificates)
        ));

        let cert = self_signed_certificate("svc", "ns").unwrap();
        let (cert_pem, _) = cert.pem_pair().unwrap();
        assert!(matches!(
            parse_key_pair(cert_pem, b""),
            Err(TlsError::NoPrivateKey)
        ));
    }

    #[test]
    fn test_load_key_pair_from_files() {
        let dir = std::env::temp_dir().join(format!("nsm-tls-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let generated = self_signed_certificate("svc", "ns").unwrap();
        let (cert_pem, key_pem) = generated.pem_pair().unwrap();
        std::fs::write(dir.join("tls.crt"), cert_pem).unwrap();
        std::fs::write(dir.join("tls.key"), key_pem).unwrap();

        let loaded = load_key_pair(&dir.join("tls.crt"), &dir.join("tls.key")).unwrap();
        assert_eq!(loaded.source(), "provided");
        assert_eq!(loaded.pem_pair().unwrap().0, cert_pem);
        // Operator supplied certificates never double as a CA bundle
        assert!(loaded.ca_bundle().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_key_pair_rejects_mismatched_key() {
        let dir = std::env::temp_dir().join(format!("nsm-tls-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let first = self_signed_certificate("a", "ns").unwrap();
        let second = self_signed_certificate("b", "ns").unwrap();
        std::fs::write(dir.join("tls.crt"), first.pem_pair().unwrap().0).unwrap();
        std::fs::write(dir.join("tls.key"), second.pem_pair().unwrap().1).unwrap();

        let loaded = load_key_pair(&dir.join("tls.crt"), &dir.join("tls.key"));
        assert!(matches!(loaded, Err(TlsError::KeyPair(_))), "{loaded:?}");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_resolve_prefers_files_over_mode() {
        let config = Config {
            webhook_mode: WebhookMode::SelfRegister,
            cert_file_path: Some(PathBuf::from("/nonexistent/tls.crt")),
            key_file_path: Some(PathBuf::from("/nonexistent/tls.key")),
            ..Config::default()
        };
        assert!(matches!(
            resolve_certificate(&config),
            Err(TlsError::Read { .. })
        ));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let cert = self_signed_certificate("svc", "ns").unwrap();
        assert_eq!(format!("{cert:?}"), "ServingCertificate(self-signed)");
    }
}
