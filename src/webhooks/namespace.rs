//! Namespace lookup used to resolve fallback annotations and the pod
//! security level.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use thiserror::Error;

/// Upper bound for a single namespace read
pub const NAMESPACE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from a namespace read. Never fatal to a request.
#[derive(Error, Debug)]
pub enum NamespaceLookupError {
    #[error("namespace lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Trait abstracting the namespace read so reviews can run without a cluster.
#[async_trait]
pub trait NamespaceLookup: Send + Sync {
    /// Fetch the namespace called `name`.
    async fn get(&self, name: &str) -> Result<Namespace, NamespaceLookupError>;
}

/// Reads namespaces from the Kubernetes API.
#[derive(Clone)]
pub struct KubeNamespaceLookup {
    api: Api<Namespace>,
    timeout: Duration,
}

impl KubeNamespaceLookup {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            timeout: NAMESPACE_LOOKUP_TIMEOUT,
        }
    }
}

#[async_trait]
impl NamespaceLookup for KubeNamespaceLookup {
    async fn get(&self, name: &str) -> Result<Namespace, NamespaceLookupError> {
        tokio::time::timeout(self.timeout, self.api.get(name))
            .await
            .map_err(|_| NamespaceLookupError::Timeout(self.timeout))?
            .map_err(NamespaceLookupError::from)
    }
}
