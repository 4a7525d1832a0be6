//! Pod Security level handling in the produced patch.

use std::sync::Arc;

use nsm_admission_webhook::webhooks::security::ENFORCE_LEVEL_LABEL;
use serde_json::Value;

use crate::common::fixtures::*;

const DIRECTIVE: &str = "kernel://icmp-responder/nsm-1";

async fn patch_in_namespace(labels: &[(&str, &str)]) -> Vec<Value> {
    let namespaces = FakeNamespaces::new().with(namespace(NAMESPACE, &[], labels));
    let reviewer = reviewer(Arc::new(namespaces));
    let pod = WorkloadBuilder::pod("nginx").annotation(ANNOTATION, DIRECTIVE);
    patch_ops(&reviewer.review(&create_request(&pod)).await)
}

fn injected_volumes(ops: &[Value]) -> Vec<Value> {
    patch_value(ops, "/spec/volumes")
        .as_array()
        .unwrap()
        .iter()
        .filter(|v| v["name"] != "data")
        .cloned()
        .collect()
}

fn injected_containers(ops: &[Value]) -> Vec<Value> {
    let mut containers = patch_value(ops, "/spec/initContainers")
        .as_array()
        .unwrap()
        .clone();
    containers.extend(
        patch_value(ops, "/spec/containers")
            .as_array()
            .unwrap()
            .iter()
            .filter(|c| c["name"] != "nginx")
            .cloned(),
    );
    containers
}

fn assert_host_paths(ops: &[Value]) {
    let volumes = injected_volumes(ops);
    assert_eq!(volumes.len(), 2);
    for volume in &volumes {
        assert!(volume.get("csi").is_none(), "{volume}");
        assert_eq!(volume["hostPath"]["type"], "Directory");
    }
    for container in injected_containers(ops) {
        assert!(container.get("securityContext").is_none(), "{container}");
    }
}

#[tokio::test]
async fn test_restricted_uses_csi_and_hardened_containers() {
    let ops = patch_in_namespace(&[(ENFORCE_LEVEL_LABEL, "restricted")]).await;

    let volumes = injected_volumes(&ops);
    let drivers: Vec<_> = volumes.iter().map(|v| v["csi"]["driver"].clone()).collect();
    assert_eq!(drivers, ["csi.spiffe.io", "csi.networkservicemesh.io"]);
    assert!(volumes.iter().all(|v| v["csi"]["readOnly"] == true));
    assert!(volumes.iter().all(|v| v.get("hostPath").is_none()));

    let containers = injected_containers(&ops);
    assert_eq!(containers.len(), 2);
    for container in &containers {
        let context = &container["securityContext"];
        assert_eq!(context["allowPrivilegeEscalation"], false);
        assert_eq!(context["capabilities"]["drop"], serde_json::json!(["ALL"]));
    }
}

#[tokio::test]
async fn test_baseline_uses_csi_without_hardening() {
    let ops = patch_in_namespace(&[(ENFORCE_LEVEL_LABEL, "baseline")]).await;

    assert!(injected_volumes(&ops).iter().all(|v| v.get("csi").is_some()));
    for container in injected_containers(&ops) {
        assert!(container.get("securityContext").is_none(), "{container}");
    }
}

#[tokio::test]
async fn test_privileged_uses_host_paths() {
    let ops = patch_in_namespace(&[(ENFORCE_LEVEL_LABEL, "privileged")]).await;
    assert_host_paths(&ops);
}

#[tokio::test]
async fn test_missing_label_uses_host_paths() {
    let ops = patch_in_namespace(&[]).await;
    assert_host_paths(&ops);
}

#[tokio::test]
async fn test_unrecognized_label_uses_host_paths() {
    for value in ["Restricted", "strict", ""] {
        let ops = patch_in_namespace(&[(ENFORCE_LEVEL_LABEL, value)]).await;
        assert_host_paths(&ops);
    }
}

#[tokio::test]
async fn test_sidecars_mount_both_sockets_read_only() {
    let ops = patch_in_namespace(&[(ENFORCE_LEVEL_LABEL, "restricted")]).await;

    for container in injected_containers(&ops) {
        let mounts = container["volumeMounts"].as_array().unwrap();
        let paths: Vec<_> = mounts.iter().map(|m| m["mountPath"].clone()).collect();
        assert_eq!(paths, ["/run/spire/sockets", "/var/lib/networkservicemesh"]);
        assert!(mounts.iter().all(|m| m["readOnly"] == true));
    }
}
