//! Compute resources of the injected sidecars.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::warn;
use url::Url;

/// Query parameter naming the SR-IOV interface pool of a network service
pub const SRIOV_TOKEN_LABEL: &str = "sriovToken";

/// Base for network service references written without a scheme.
const RELATIVE_BASE: &str = "kernel:///";

/// Static requests and limits from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarResources {
    pub limits_cpu: String,
    pub limits_memory: String,
    pub requests_cpu: String,
    pub requests_memory: String,
}

impl SidecarResources {
    /// Resource requirements for a sidecar. `pools` adds one limit per
    /// interface pool the workload asked for.
    pub fn requirements(&self, pools: Option<&BTreeMap<String, usize>>) -> ResourceRequirements {
        let mut limits: BTreeMap<String, Quantity> = pools
            .into_iter()
            .flatten()
            .map(|(pool, count)| (pool.clone(), Quantity(count.to_string())))
            .collect();
        limits.insert("cpu".to_string(), Quantity(self.limits_cpu.clone()));
        limits.insert("memory".to_string(), Quantity(self.limits_memory.clone()));

        let requests = BTreeMap::from([
            ("cpu".to_string(), Quantity(self.requests_cpu.clone())),
            ("memory".to_string(), Quantity(self.requests_memory.clone())),
        ]);

        ResourceRequirements {
            limits: Some(limits),
            requests: Some(requests),
            ..Default::default()
        }
    }
}

fn parse_network_service(token: &str) -> Result<Url, String> {
    // Url::parse strips surrounding whitespace; such entries are malformed
    if token.trim() != token {
        return Err("surrounding whitespace".to_string());
    }
    match Url::parse(token) {
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(RELATIVE_BASE)
            .and_then(|base| base.join(token))
            .map_err(|e| e.to_string()),
        other => other.map_err(|e| e.to_string()),
    }
}

/// Count the interface pools referenced by a comma-separated list of
/// network service URLs.
///
/// Returns `None` when any entry fails to parse; partial results are
/// never used.
pub fn pool_resources(annotation: &str) -> Option<BTreeMap<String, usize>> {
    let urls = annotation
        .split(',')
        .map(|token| {
            parse_network_service(token).inspect_err(|e| {
                warn!(token = %token, error = %e, "Malformed network service annotation");
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    let mut pools = BTreeMap::new();
    for url in &urls {
        let token = url
            .query_pairs()
            .find(|(k, _)| k == SRIOV_TOKEN_LABEL)
            .map(|(_, v)| v);
        if let Some(token) = token {
            let pool = token.split(',').next().unwrap_or_default().to_string();
            *pools.entry(pool).or_insert(0) += 1;
        }
    }
    Some(pools)
}
