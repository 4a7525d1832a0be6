//! Test fixtures and builders for admission reviews.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde_json::{Value, json};

use nsm_admission_webhook::webhooks::mutation::{SidecarResources, SidecarSpec, static_env};
use nsm_admission_webhook::webhooks::{
    AdmissionRequest, AdmissionReview, NamespaceLookup, NamespaceLookupError, ReviewOutcome,
    Reviewer,
};

pub const ANNOTATION: &str = "networkservicemesh.io";
pub const NSURL_ENV_NAME: &str = "NSM_NETWORK_SERVICES";
pub const NAMESPACE: &str = "default";
pub const INIT_IMAGE: &str = "ghcr.io/networkservicemesh/cmd-nsc-init:v1.14.0";
pub const SIDECAR_IMAGE: &str = "ghcr.io/networkservicemesh/cmd-nsc:v1.14.0";

/// Builder for workload objects as the API server would send them.
///
/// # Example
/// ```
/// let object = WorkloadBuilder::new("Deployment", "nginx")
///     .annotation(ANNOTATION, "kernel://icmp-responder/nsm-1")
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct WorkloadBuilder {
    kind: String,
    name: String,
    generate_name: Option<String>,
    annotations: BTreeMap<String, String>,
    template_annotations: Option<BTreeMap<String, String>>,
    labels: BTreeMap<String, String>,
    owner_kind: Option<String>,
}

impl WorkloadBuilder {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            generate_name: None,
            annotations: BTreeMap::new(),
            template_annotations: None,
            labels: BTreeMap::from([("app".to_string(), "nginx".to_string())]),
            owner_kind: None,
        }
    }

    pub fn pod(name: impl Into<String>) -> Self {
        Self::new("Pod", name)
    }

    /// Annotation on the workload itself.
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Annotations on the pod template. Ignored for pods.
    pub fn template_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.template_annotations = Some(annotations);
        self
    }

    pub fn generate_name(mut self, prefix: impl Into<String>) -> Self {
        self.generate_name = Some(prefix.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn owned_by(mut self, kind: impl Into<String>) -> Self {
        self.owner_kind = Some(kind.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    fn pod_spec() -> Value {
        json!({
            "containers": [{ "name": "nginx", "image": "nginx:1.27" }],
            "volumes": [{ "name": "data", "emptyDir": {} }]
        })
    }

    fn pod_metadata(&self, annotations: Option<&BTreeMap<String, String>>) -> Value {
        let mut metadata = json!({ "labels": self.labels });
        if let Some(prefix) = &self.generate_name {
            metadata["generateName"] = json!(prefix);
        }
        if let Some(annotations) = annotations {
            metadata["annotations"] = json!(annotations);
        }
        metadata
    }

    /// Build the object as JSON.
    pub fn build(&self) -> Value {
        if self.kind == "Pod" {
            let mut metadata = self.pod_metadata(Some(&self.annotations));
            metadata["name"] = json!(self.name);
            metadata["namespace"] = json!(NAMESPACE);
            return json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": metadata,
                "spec": Self::pod_spec(),
            });
        }

        let mut metadata = json!({
            "name": self.name,
            "namespace": NAMESPACE,
            "annotations": self.annotations,
        });
        if let Some(owner) = &self.owner_kind {
            metadata["ownerReferences"] = json!([{
                "apiVersion": "apps/v1",
                "kind": owner,
                "name": self.name,
                "uid": "6b0b9f3e-6f5c-4f1e-9d1e-2f4a1c3b5d7e",
                "controller": true
            }]);
        }

        json!({
            "apiVersion": "apps/v1",
            "kind": self.kind,
            "metadata": metadata,
            "spec": {
                "selector": { "matchLabels": { "app": "nginx" } },
                "serviceName": self.name,
                "template": {
                    "metadata": self.pod_metadata(self.template_annotations.as_ref()),
                    "spec": Self::pod_spec(),
                }
            }
        })
    }
}

fn plural(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

/// An admission request for `object` as decoded by the webhook server.
pub fn admission_request(
    kind: &str,
    operation: &str,
    namespace: Option<&str>,
    object: Option<Value>,
) -> AdmissionRequest<DynamicObject> {
    let group = if kind == "Pod" { "" } else { "apps" };
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": { "group": group, "version": "v1", "kind": kind },
            "resource": { "group": group, "version": "v1", "resource": plural(kind) },
            "operation": operation,
            "namespace": namespace,
            "name": "nginx",
            "userInfo": { "username": "system:serviceaccount:kube-system:replicaset-controller" },
            "object": object,
            "dryRun": false
        }
    }))
    .expect("valid AdmissionReview");
    review.try_into().expect("review carries a request")
}

/// CREATE request for the object built by `builder` in the default namespace.
pub fn create_request(builder: &WorkloadBuilder) -> AdmissionRequest<DynamicObject> {
    admission_request(
        builder.kind(),
        "CREATE",
        Some(NAMESPACE),
        Some(builder.build()),
    )
}

/// A namespace with the given annotations and labels.
pub fn namespace(name: &str, annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Namespace {
    let collect = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    };
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(collect(annotations)),
            labels: Some(collect(labels)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// In-memory namespace store that counts lookups.
#[derive(Default)]
pub struct FakeNamespaces {
    namespaces: BTreeMap<String, Namespace>,
    failing: bool,
    calls: AtomicUsize,
}

impl FakeNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store where every lookup times out.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn with(mut self, namespace: Namespace) -> Self {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.namespaces.insert(name, namespace);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NamespaceLookup for FakeNamespaces {
    async fn get(&self, name: &str) -> Result<Namespace, NamespaceLookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(NamespaceLookupError::Timeout(Duration::from_secs(1)));
        }
        self.namespaces
            .get(name)
            .cloned()
            .ok_or(NamespaceLookupError::Timeout(Duration::from_secs(1)))
    }
}

/// Sidecar description used across the scenarios.
pub fn sidecar_spec() -> SidecarSpec {
    SidecarSpec {
        init_container_images: vec![INIT_IMAGE.to_string()],
        container_images: vec![SIDECAR_IMAGE.to_string()],
        labels: BTreeMap::from([("spiffe.io/spiffe-id".to_string(), "true".to_string())]),
        resources: SidecarResources {
            limits_cpu: "200m".to_string(),
            limits_memory: "80Mi".to_string(),
            requests_cpu: "100m".to_string(),
            requests_memory: "40Mi".to_string(),
        },
    }
}

/// A reviewer backed by `namespaces`.
pub fn reviewer(namespaces: Arc<FakeNamespaces>) -> Reviewer {
    Reviewer::new(
        sidecar_spec(),
        ANNOTATION,
        NSURL_ENV_NAME,
        static_env(&["LOG_LEVEL=TRACE".to_string()]).expect("valid env"),
        namespaces,
    )
}

/// Decoded JSON Patch operations of a response.
pub fn patch_ops(outcome: &ReviewOutcome) -> Vec<Value> {
    let patch = outcome.response.patch.as_ref().expect("response has a patch");
    serde_json::from_slice(patch).expect("patch is JSON")
}

/// Value of the `add` operation targeting `path`.
pub fn patch_value<'a>(ops: &'a [Value], path: &str) -> &'a Value {
    let op = ops
        .iter()
        .find(|op| op["path"] == path)
        .unwrap_or_else(|| panic!("no operation for {path}"));
    assert_eq!(op["op"], "add");
    &op["value"]
}

/// Value of env var `name` on the first injected sidecar.
pub fn sidecar_env(ops: &[Value], containers_path: &str, name: &str) -> Option<String> {
    let containers = patch_value(ops, containers_path).as_array()?;
    let sidecar = containers.iter().find(|c| c["image"] == SIDECAR_IMAGE)?;
    sidecar["env"]
        .as_array()?
        .iter()
        .find(|e| e["name"] == name)
        .and_then(|e| e["value"].as_str())
        .map(str::to_string)
}
