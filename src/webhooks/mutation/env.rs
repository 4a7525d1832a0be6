//! Environment injected into every sidecar container.

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector};

use crate::config::{ConfigError, non_empty};

/// Location of the SPIRE agent workload API socket inside the sidecar
pub const SPIFFE_ENDPOINT_SOCKET: &str = "unix:///run/spire/sockets/agent.sock";

/// Env var carrying the client identity of the sidecar
pub const NSM_NAME_ENV: &str = "NSM_NAME";

fn value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Parse the configured `KEY=VALUE` entries and append the bootstrap
/// variables every sidecar needs.
pub fn static_env(entries: &[String]) -> Result<Vec<EnvVar>, ConfigError> {
    let mut envs = non_empty(entries)
        .map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, v)| value(k, v))
                .ok_or_else(|| ConfigError::InvalidEnv(entry.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    envs.push(value("SPIFFE_ENDPOINT_SOCKET", SPIFFE_ENDPOINT_SOCKET));
    envs.push(EnvVar {
        name: "POD_NAME".to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: "metadata.name".to_string(),
            }),
            ..Default::default()
        }),
    });

    Ok(envs)
}

/// Client identity for the sidecar.
///
/// Pods stamped from a template get a unique name from their controller;
/// anything else gets a random suffix so identities never collide.
pub fn nsm_name(has_generate_name: bool) -> String {
    if has_generate_name {
        "$(POD_NAME)".to_string()
    } else {
        format!("$(POD_NAME)-{}", uuid::Uuid::new_v4())
    }
}

/// Full sidecar environment for one workload.
pub fn workload_env(
    base: &[EnvVar],
    nsurl_env_name: &str,
    annotation: &str,
    has_generate_name: bool,
) -> Vec<EnvVar> {
    let mut envs = base.to_vec();
    envs.push(value(nsurl_env_name, annotation));
    envs.push(value(NSM_NAME_ENV, &nsm_name(has_generate_name)));
    envs
}
