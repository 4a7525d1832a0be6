//! File-backed SPIFFE identity source, used when `NSM_SVID_DIR` is set.
//!
//! The SPIRE helper keeps the workload X.509 SVID on disk and rotates it
//! in place. [`SvidFileSource`] hands the current pair to rustls on every
//! handshake and picks up rotations by watching file modification times.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use super::{TlsError, parse_key_pair, read_file, signing_pair};

/// Certificate chain file written by the SPIRE helper
pub const SVID_CERT_FILE: &str = "svid.pem";

/// Private key file written by the SPIRE helper
pub const SVID_KEY_FILE: &str = "svid_key.pem";

#[derive(Debug)]
struct Loaded {
    key: Arc<CertifiedKey>,
    modified: Option<SystemTime>,
}

/// Serves the on-disk X.509 SVID, reloading it when the files change.
#[derive(Debug)]
pub struct SvidFileSource {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: RwLock<Loaded>,
}

impl SvidFileSource {
    /// Load the SVID from `dir`. Fails if the pair is missing or unusable.
    pub fn load(dir: &Path) -> Result<Self, TlsError> {
        let cert_path = dir.join(SVID_CERT_FILE);
        let key_path = dir.join(SVID_KEY_FILE);

        let key = certified_key(&cert_path, &key_path)
            .map_err(|e| TlsError::IdentitySource(e.to_string()))?;
        let modified = modified_at(&cert_path, &key_path);

        info!(dir = %dir.display(), "Loaded X.509 SVID");
        Ok(Self {
            cert_path,
            key_path,
            current: RwLock::new(Loaded { key, modified }),
        })
    }

    /// The key currently being served, reloading first if the files changed.
    pub fn current(&self) -> Arc<CertifiedKey> {
        let modified = modified_at(&self.cert_path, &self.key_path);
        {
            let current = self.current.read();
            if modified.is_none() || current.modified == modified {
                return current.key.clone();
            }
        }

        let mut current = self.current.write();
        if current.modified == modified {
            return current.key.clone();
        }

        match certified_key(&self.cert_path, &self.key_path) {
            Ok(key) => {
                debug!(cert = %self.cert_path.display(), "Reloaded rotated X.509 SVID");
                current.key = key;
                current.modified = modified;
            }
            Err(e) => {
                // Files can be observed mid-rotation; keep serving the old pair
                warn!(error = %e, "Failed to reload X.509 SVID, serving previous one");
            }
        }
        current.key.clone()
    }
}

impl ResolvesServerCert for SvidFileSource {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

fn certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>, TlsError> {
    let cert_pem = read_file(cert_path)?;
    let key_pem = read_file(key_path)?;
    let (certs, key) = parse_key_pair(&cert_pem, &key_pem)?;
    signing_pair(certs, key)
}

/// Latest modification time across both files.
fn modified_at(cert_path: &Path, key_path: &Path) -> Option<SystemTime> {
    let mtime = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    match (mtime(cert_path), mtime(key_path)) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}
