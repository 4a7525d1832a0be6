//! JSON Patch construction for sidecar injection.
//!
//! A patch always carries exactly four `add` operations, rooted at the pod
//! (bare pods) or at `/spec/template` (controllers):
//! 1. `spec/initContainers`: existing init containers plus the init sidecars
//! 2. `spec/containers`: existing containers plus the sidecars
//! 3. `spec/volumes`: existing volumes plus the two socket volumes
//! 4. `metadata/labels`: workload labels merged with the configured labels
//!
//! Every step builds a fresh collection from the immutable view.

mod containers;
mod env;
mod resources;
mod volumes;

pub use containers::{container_name, security_context, sidecar};
pub use env::{NSM_NAME_ENV, SPIFFE_ENDPOINT_SOCKET, nsm_name, static_env, workload_env};
pub use resources::{SRIOV_TOKEN_LABEL, SidecarResources, pool_resources};
pub use volumes::{
    NSM_CSI_DRIVER, NSM_SOCKET_PATH, NSM_SOCKET_VOLUME, SPIFFE_CSI_DRIVER,
    SPIRE_AGENT_SOCKET_PATH, SPIRE_AGENT_SOCKET_VOLUME, sidecar_volumes, volume_mounts,
};

use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{Container, EnvVar, Volume};
use serde::Serialize;

use super::security::SecurityLevel;
use super::workload::WorkloadView;

/// Static description of what gets injected into every workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarSpec {
    pub init_container_images: Vec<String>,
    pub container_images: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub resources: SidecarResources,
}

impl SidecarSpec {
    /// Init containers after injection. Init sidecars also get one limit
    /// per interface pool requested by the directive.
    pub fn init_containers(
        &self,
        view: &WorkloadView,
        annotation: &str,
        level: SecurityLevel,
        env: &[EnvVar],
    ) -> Vec<Container> {
        let pools = pool_resources(annotation);
        let requirements = self.resources.requirements(pools.as_ref());

        let mut init_containers = view.spec.init_containers.clone().unwrap_or_default();
        init_containers.extend(
            self.init_container_images
                .iter()
                .map(|image| sidecar(image, env, requirements.clone(), level)),
        );
        init_containers
    }

    /// Containers after injection.
    pub fn containers(
        &self,
        view: &WorkloadView,
        level: SecurityLevel,
        env: &[EnvVar],
    ) -> Vec<Container> {
        let requirements = self.resources.requirements(None);

        let mut containers = view.spec.containers.clone();
        containers.extend(
            self.container_images
                .iter()
                .map(|image| sidecar(image, env, requirements.clone(), level)),
        );
        containers
    }

    /// Volumes after injection.
    pub fn volumes(&self, view: &WorkloadView, level: SecurityLevel) -> Vec<Volume> {
        let mut volumes = view.spec.volumes.clone().unwrap_or_default();
        volumes.extend(sidecar_volumes(level));
        volumes
    }

    /// Workload labels overlaid with the configured labels.
    pub fn merged_labels(&self, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = labels.clone();
        merged.extend(self.labels.clone());
        merged
    }
}

fn add(
    root: &[&str],
    tokens: &[&str],
    value: impl Serialize,
) -> Result<PatchOperation, serde_json::Error> {
    Ok(PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(root.iter().chain(tokens).copied()),
        value: serde_json::to_value(value)?,
    }))
}

/// Build the injection patch for a workload.
///
/// `env` is the complete sidecar environment, see [`workload_env`].
pub fn build_patch(
    spec: &SidecarSpec,
    view: &WorkloadView,
    annotation: &str,
    level: SecurityLevel,
    env: &[EnvVar],
) -> Result<Patch, serde_json::Error> {
    let root = view.kind.template_root();

    Ok(Patch(vec![
        add(
            root,
            &["spec", "initContainers"],
            spec.init_containers(view, annotation, level, env),
        )?,
        add(
            root,
            &["spec", "containers"],
            spec.containers(view, level, env),
        )?,
        add(root, &["spec", "volumes"], spec.volumes(view, level))?,
        add(
            root,
            &["metadata", "labels"],
            spec.merged_labels(view.labels()),
        )?,
    ]))
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
    use serde_json::json;

    fn spec() -> SidecarSpec {
        SidecarSpec {
            init_container_images: vec!["ghcr.io/networkservicemesh/cmd-nsc-init:v1".to_string()],
            container_images: vec!["ghcr.io/networkservicemesh/cmd-nsc:v1".to_string()],
            labels: BTreeMap::from([("spiffe.io/spiffe-id".to_string(), "true".to_string())]),
            resources: SidecarResources {
                limits_cpu: "200m".to_string(),
                limits_memory: "80Mi".to_string(),
                requests_cpu: "100m".to_string(),
                requests_memory: "40Mi".to_string(),
            },
        }
    }

    fn pod() -> WorkloadView {
        WorkloadView::decode(
            "Pod",
            json!({
                "metadata": { "name": "client", "labels": { "app": "client" } },
                "spec": {
                    "containers": [{ "name": "app", "image": "alpine" }],
                    "volumes": [{ "name": "data", "emptyDir": {} }]
                }
            }),
        )
        .unwrap()
    }

    fn pod_patch(annotation: &str, level: SecurityLevel) -> Patch {
        build_patch(&spec(), &pod(), annotation, level, &[]).unwrap()
    }

    fn paths(patch: &Patch) -> Vec<String> {
        patch
            .0
            .iter()
            .map(|op| match op {
                PatchOperation::Add(add) => add.path.to_string(),
                other => panic!("unexpected operation {other:?}"),
            })
            .collect()
    }

    fn value(patch: &Patch, index: usize) -> &serde_json::Value {
        match &patch.0[index] {
            PatchOperation::Add(add) => &add.value,
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_pod_patch_paths() {
        let patch = pod_patch("kernel://ns", SecurityLevel::Privileged);
        assert_eq!(
            paths(&patch),
            [
                "/spec/initContainers",
                "/spec/containers",
                "/spec/volumes",
                "/metadata/labels"
            ]
        );
    }

    #[test]
    fn test_wrapper_patch_paths() {
        let view = WorkloadView::decode(
            "DaemonSet",
            json!({
                "metadata": {
                    "name": "agent",
                    "annotations": { "networkservicemesh.io": "kernel://ns" }
                },
                "spec": {
                    "selector": { "matchLabels": { "app": "agent" } },
                    "template": { "spec": { "containers": [] } }
                }
            }),
        )
        .unwrap();

        let patch =
            build_patch(&spec(), &view, "kernel://ns", SecurityLevel::Privileged, &[]).unwrap();
        assert_eq!(
            paths(&patch),
            [
                "/spec/template/spec/initContainers",
                "/spec/template/spec/containers",
                "/spec/template/spec/volumes",
                "/spec/template/metadata/labels"
            ]
        );
    }

    #[test]
    fn test_existing_entries_are_kept() {
        let patch = pod_patch("kernel://ns", SecurityLevel::Privileged);

        let containers = value(&patch, 1).as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["name"], "app");
        assert_eq!(containers[1]["name"], "cmd-nsc");

        let volumes = value(&patch, 2).as_array().unwrap();
        let names: Vec<_> = volumes.iter().map(|v| v["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["data", SPIRE_AGENT_SOCKET_VOLUME, NSM_SOCKET_VOLUME]);

        let init = value(&patch, 0).as_array().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0]["name"], "cmd-nsc-init");
    }

    #[test]
    fn test_labels_are_merged() {
        let patch = pod_patch("kernel://ns", SecurityLevel::Privileged);
        assert_eq!(
            value(&patch, 3),
            &json!({ "app": "client", "spiffe.io/spiffe-id": "true" })
        );
    }

    #[test]
    fn test_configured_labels_win() {
        let spec = SidecarSpec {
            labels: BTreeMap::from([("app".to_string(), "mesh".to_string())]),
            ..spec()
        };
        let merged = spec.merged_labels(pod().labels());
        assert_eq!(merged.get("app"), Some(&"mesh".to_string()));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_pool_limits_only_on_init_containers() {
        let annotation = "kernel://vl3/nsm-1?sriovToken=intel.com/10G";
        let patch = pod_patch(annotation, SecurityLevel::Privileged);

        let init = &value(&patch, 0)[0];
        assert_eq!(init["resources"]["limits"]["intel.com/10G"], "1");
        assert_eq!(init["resources"]["limits"]["cpu"], "200m");
        assert_eq!(init["resources"]["requests"]["memory"], "40Mi");

        let sidecar = &value(&patch, 1)[1];
        assert!(sidecar["resources"]["limits"].get("intel.com/10G").is_none());
        assert_eq!(sidecar["resources"]["limits"]["memory"], "80Mi");
    }

    #[test]
    fn test_restricted_namespace_hardens_sidecars() {
        let patch = pod_patch("kernel://ns", SecurityLevel::Restricted);

        for (index, position) in [(0, 0), (1, 1)] {
            let ctx = &value(&patch, index)[position]["securityContext"];
            assert_eq!(ctx["allowPrivilegeEscalation"], false);
            assert_eq!(ctx["capabilities"]["drop"], json!(["ALL"]));
        }
        // The workload's own container is left alone
        assert!(value(&patch, 1)[0].get("securityContext").is_none());

        let volumes = value(&patch, 2).as_array().unwrap();
        assert!(volumes[1..].iter().all(|v| v.get("csi").is_some()));
    }

    #[test]
    fn test_env_is_passed_through() {
        let base = static_env(&[]).unwrap();
        let env = workload_env(&base, "NSM_NETWORK_SERVICES", "kernel://ns", true);
        let patch =
            build_patch(&spec(), &pod(), "kernel://ns", SecurityLevel::Privileged, &env).unwrap();

        let injected = &value(&patch, 1)[1]["env"];
        assert_eq!(injected.as_array().unwrap().len(), env.len());
        assert_eq!(injected[2]["name"], "NSM_NETWORK_SERVICES");
        assert_eq!(injected[2]["value"], "kernel://ns");
    }
}
