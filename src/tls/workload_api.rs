//! SPIFFE Workload API identity source.
//!
//! The X.509 SVID is streamed from the SPIRE agent over the socket named
//! by `SPIFFE_ENDPOINT_SOCKET` and handed to rustls on every handshake.
//! Rotations pushed by the agent are picked up on the next handshake.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use spiffe::{SvidSource, X509Source, X509Svid};
use tracing::{debug, info, warn};

use super::{TlsError, signing_pair};

/// Upper bound for receiving the first SVID at startup
pub const WORKLOAD_API_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

struct Served {
    leaf: Vec<u8>,
    key: Arc<CertifiedKey>,
}

/// Serves the X.509 SVID issued through the SPIFFE Workload API.
pub struct WorkloadApiSource {
    source: Arc<X509Source>,
    served: RwLock<Option<Served>>,
}

impl std::fmt::Debug for WorkloadApiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadApiSource").finish_non_exhaustive()
    }
}

impl WorkloadApiSource {
    /// Connect to the Workload API and wait for the first SVID.
    pub async fn connect(timeout: Duration) -> Result<Self, TlsError> {
        let source = tokio::time::timeout(timeout, X509Source::default())
            .await
            .map_err(|_| {
                TlsError::IdentitySource(format!("no X.509 SVID received within {:?}", timeout))
            })?
            .map_err(|e| TlsError::IdentitySource(format!("error getting x509 source: {}", e)))?;

        let this = Self {
            source,
            served: RwLock::new(None),
        };
        let svid = this.fetch()?;
        this.install(&svid)?;

        info!(spiffe_id = %svid.spiffe_id(), "Connected to SPIFFE Workload API");
        Ok(this)
    }

    fn fetch(&self) -> Result<X509Svid, TlsError> {
        self.source
            .get_svid()
            .map_err(|e| TlsError::IdentitySource(e.to_string()))?
            .ok_or_else(|| TlsError::IdentitySource("no X.509 SVID available".to_string()))
    }

    fn install(&self, svid: &X509Svid) -> Result<Arc<CertifiedKey>, TlsError> {
        let chain: Vec<&[u8]> = svid.cert_chain().iter().map(|c| c.content()).collect();
        let key = svid_key(&chain, svid.private_key().content())?;

        *self.served.write() = Some(Served {
            leaf: svid.leaf().content().to_vec(),
            key: key.clone(),
        });
        Ok(key)
    }

    /// The key to present, rebuilt only when the agent rotated the SVID.
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        let cached = || self.served.read().as_ref().map(|s| s.key.clone());

        let svid = match self.fetch() {
            Ok(svid) => svid,
            Err(e) => {
                warn!(error = %e, "Failed to get X.509 SVID, serving previous one");
                return cached();
            }
        };

        if let Some(served) = self.served.read().as_ref() {
            if served.leaf == svid.leaf().content() {
                return Some(served.key.clone());
            }
        }

        match self.install(&svid) {
            Ok(key) => {
                debug!(spiffe_id = %svid.spiffe_id(), "Serving rotated X.509 SVID");
                Some(key)
            }
            Err(e) => {
                warn!(error = %e, "Rotated X.509 SVID is unusable, serving previous one");
                cached()
            }
        }
    }
}

impl ResolvesServerCert for WorkloadApiSource {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

/// Build the served key from a DER certificate chain and PKCS#8 key.
fn svid_key(chain: &[&[u8]], pkcs8_key: &[u8]) -> Result<Arc<CertifiedKey>, TlsError> {
    if chain.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    let certs = chain
        .iter()
        .map(|der| CertificateDer::from(der.to_vec()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8_key.to_vec()));
    signing_pair(certs, key)
}
