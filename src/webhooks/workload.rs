//! Kind dispatch for admitted objects.
//!
//! Every supported kind is decoded into a [`WorkloadView`]: the metadata
//! and spec of the pod that will eventually run, independent of whether
//! the object is a bare pod or a controller wrapping a pod template.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

/// Reasons a request carries no usable workload.
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: WorkloadKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed workload: annotations can't be provided in several places")]
    DuplicateAnnotations,

    #[error("replicaset is owned by a deployment")]
    OwnedByDeployment,
}

/// The closed set of kinds the webhook knows how to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Pod,
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::Pod,
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
        WorkloadKind::ReplicaSet,
    ];

    /// Map a declared kind onto a supported workload kind.
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Pod" => Some(WorkloadKind::Pod),
            "Deployment" => Some(WorkloadKind::Deployment),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "ReplicaSet" => Some(WorkloadKind::ReplicaSet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "Pod",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
        }
    }

    pub fn is_pod(&self) -> bool {
        matches!(self, WorkloadKind::Pod)
    }

    /// JSON pointer tokens of the pod template inside the object.
    pub fn template_root(&self) -> &'static [&'static str] {
        if self.is_pod() {
            &[]
        } else {
            &["spec", "template"]
        }
    }

    /// Plural resource name under which the kind is served.
    pub fn plural(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "pods",
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::DaemonSet => "daemonsets",
            WorkloadKind::StatefulSet => "statefulsets",
            WorkloadKind::ReplicaSet => "replicasets",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-normalized view of an admitted workload.
#[derive(Debug, Clone)]
pub struct WorkloadView {
    pub kind: WorkloadKind,
    /// Pod (template) metadata. `labels` is always `Some`.
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

impl WorkloadView {
    /// Decode `object` according to the declared `kind`.
    pub fn decode(kind: &str, object: serde_json::Value) -> Result<Self, WorkloadError> {
        let kind = WorkloadKind::from_kind(kind)
            .ok_or_else(|| WorkloadError::UnsupportedKind(kind.to_string()))?;
        let decode_err = |source| WorkloadError::Decode { kind, source };

        let (wrapper, template) = match kind {
            WorkloadKind::Pod => {
                let pod: Pod = serde_json::from_value(object).map_err(decode_err)?;
                return Ok(Self::new(kind, pod.metadata, pod.spec.unwrap_or_default()));
            }
            WorkloadKind::Deployment => {
                let d: Deployment = serde_json::from_value(object).map_err(decode_err)?;
                (d.metadata, d.spec.map(|s| s.template))
            }
            WorkloadKind::DaemonSet => {
                let d: DaemonSet = serde_json::from_value(object).map_err(decode_err)?;
                (d.metadata, d.spec.map(|s| s.template))
            }
            WorkloadKind::StatefulSet => {
                let s: StatefulSet = serde_json::from_value(object).map_err(decode_err)?;
                (s.metadata, s.spec.map(|s| s.template))
            }
            WorkloadKind::ReplicaSet => {
                let r: ReplicaSet = serde_json::from_value(object).map_err(decode_err)?;
                (r.metadata, r.spec.and_then(|s| s.template))
            }
        };

        Self::from_template(kind, wrapper, template.unwrap_or_default())
    }

    fn new(kind: WorkloadKind, mut metadata: ObjectMeta, spec: PodSpec) -> Self {
        metadata.labels.get_or_insert_with(BTreeMap::new);
        Self {
            kind,
            metadata,
            spec,
        }
    }

    fn from_template(
        kind: WorkloadKind,
        wrapper: ObjectMeta,
        template: PodTemplateSpec,
    ) -> Result<Self, WorkloadError> {
        let mut metadata = template.metadata.unwrap_or_default();

        // The wrapper's annotations drive injection; the template must not
        // carry its own set.
        if metadata.annotations.is_some() {
            return Err(WorkloadError::DuplicateAnnotations);
        }
        metadata.annotations = wrapper.annotations;

        if kind == WorkloadKind::ReplicaSet
            && wrapper
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.kind == "Deployment")
        {
            return Err(WorkloadError::OwnedByDeployment);
        }

        Ok(Self::new(kind, metadata, template.spec.unwrap_or_default()))
    }

    /// Value of annotation `key` on the workload, if set and non-empty.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether the pod name will receive a controller generated suffix.
    pub fn has_generate_name(&self) -> bool {
        self.metadata
            .generate_name
            .as_deref()
            .is_some_and(|g| !g.is_empty())
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }
}
