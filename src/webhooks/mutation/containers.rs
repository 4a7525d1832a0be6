//! Sidecar container construction.

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, ResourceRequirements, SecurityContext,
};

use super::volumes::volume_mounts;
use crate::webhooks::security::SecurityLevel;

/// Container name for an image reference: the last path segment without
/// its tag.
///
/// Images that share a base name produce the same container name.
pub fn container_name(image: &str) -> String {
    let trimmed = image.trim_end_matches('/');
    let base = if image.is_empty() {
        "."
    } else if trimmed.is_empty() {
        "/"
    } else {
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    };
    base.split(':').next().unwrap_or(base).to_string()
}

/// Security context required by the `restricted` Pod Security Standard.
pub fn security_context(level: SecurityLevel) -> Option<SecurityContext> {
    (level == SecurityLevel::Restricted).then(|| SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// One sidecar container running `image`.
pub fn sidecar(
    image: &str,
    env: &[EnvVar],
    resources: ResourceRequirements,
    level: SecurityLevel,
) -> Container {
    Container {
        name: container_name(image),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(env.to_vec()),
        volume_mounts: Some(volume_mounts()),
        resources: Some(resources),
        security_context: security_context(level),
        ..Default::default()
    }
}
