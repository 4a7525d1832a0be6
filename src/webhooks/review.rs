//! Per-request admission decision.
//!
//! A review never denies. The outcome is either the unmodified request or
//! the request with the injection patch attached; failures only ever
//! remove the patch.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{EnvVar, Namespace};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use tracing::{debug, error, info, warn};

use super::annotation::{needs_namespace_fallback, resolve_annotation};
use super::mutation::{self, SidecarSpec};
use super::namespace::NamespaceLookup;
use super::security::SecurityLevel;
use super::workload::{WorkloadError, WorkloadKind, WorkloadView};
use crate::config::{ConfigResolver, ResolveError};
use crate::health::HealthState;

/// What a review did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not a CREATE; nothing was inspected
    Skipped,
    /// No usable workload or no directive
    Unmodified,
    /// The injection patch was attached
    Patched,
    /// The patch could not be serialized; the response carries the error
    PatchFailed,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Skipped => "skipped",
            Decision::Unmodified => "unmodified",
            Decision::Patched => "patched",
            Decision::PatchFailed => "patch_failed",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to send back together with how it was reached.
#[derive(Debug)]
pub struct ReviewOutcome {
    pub response: AdmissionResponse,
    pub decision: Decision,
}

/// Decides and builds the mutation for admission requests.
pub struct Reviewer {
    spec: SidecarSpec,
    annotation: String,
    nsurl_env_name: String,
    envs: Vec<EnvVar>,
    namespaces: Arc<dyn NamespaceLookup>,
    health_state: Option<Arc<HealthState>>,
}

impl Reviewer {
    pub fn new(
        spec: SidecarSpec,
        annotation: impl Into<String>,
        nsurl_env_name: impl Into<String>,
        envs: Vec<EnvVar>,
        namespaces: Arc<dyn NamespaceLookup>,
    ) -> Self {
        Self {
            spec,
            annotation: annotation.into(),
            nsurl_env_name: nsurl_env_name.into(),
            envs,
            namespaces,
            health_state: None,
        }
    }

    /// Build a reviewer from the resolved configuration.
    pub fn from_config(
        resolver: &ConfigResolver,
        namespaces: Arc<dyn NamespaceLookup>,
    ) -> Result<Self, ResolveError> {
        let config = resolver.config();
        Ok(Self::new(
            config.sidecar_spec()?,
            config.annotation.clone(),
            config.nsurl_env_name.clone(),
            resolver.envs()?.to_vec(),
            namespaces,
        ))
    }

    /// Record metrics into `state`.
    pub fn with_health_state(mut self, state: Arc<HealthState>) -> Self {
        self.health_state = Some(state);
        self
    }

    /// Review a single admission request.
    pub async fn review(&self, request: &AdmissionRequest<DynamicObject>) -> ReviewOutcome {
        let started = Instant::now();
        let kind = request.kind.kind.as_str();

        info!(
            uid = %request.uid,
            kind = %kind,
            namespace = ?request.namespace,
            name = %request.name,
            operation = ?request.operation,
            "Incoming admission request"
        );

        let outcome = self.decide(request).await;

        let patch = outcome
            .response
            .patch
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        info!(
            uid = %request.uid,
            kind = %kind,
            decision = %outcome.decision,
            allowed = outcome.response.allowed,
            message = %outcome.response.result.message,
            patch = %patch,
            "Outgoing admission response"
        );

        if let Some(state) = &self.health_state {
            // Label values stay bounded to the supported kinds
            let kind_label = WorkloadKind::from_kind(kind).map_or("other", |k| k.as_str());
            state.metrics.record_review(
                kind_label,
                outcome.decision.as_str(),
                started.elapsed().as_secs_f64(),
            );
        }
        outcome
    }

    async fn decide(&self, request: &AdmissionRequest<DynamicObject>) -> ReviewOutcome {
        let allow = |decision| ReviewOutcome {
            response: AdmissionResponse::from(request),
            decision,
        };

        if request.operation != Operation::Create {
            return allow(Decision::Skipped);
        }

        let view = match self.view(request) {
            Some(view) => view,
            None => return allow(Decision::Unmodified),
        };

        let own = view.annotation(&self.annotation);
        let mut namespace = None;
        let mut namespace_fetched = false;
        if needs_namespace_fallback(view.kind, own) {
            namespace = self.namespace(request).await;
            namespace_fetched = true;
        }

        let annotation =
            match resolve_annotation(view.kind, own, namespace.as_ref(), &self.annotation) {
                Some(annotation) => annotation,
                None => {
                    debug!(uid = %request.uid, kind = %view.kind, "No injection directive");
                    return allow(Decision::Unmodified);
                }
            };

        if !namespace_fetched {
            namespace = self.namespace(request).await;
        }
        let level = SecurityLevel::classify(namespace.as_ref());

        let env = mutation::workload_env(
            &self.envs,
            &self.nsurl_env_name,
            &annotation,
            view.has_generate_name(),
        );

        debug!(
            uid = %request.uid,
            kind = %view.kind,
            annotation = %annotation,
            level = %level,
            "Injecting sidecars"
        );

        let patched = mutation::build_patch(&self.spec, &view, &annotation, level, &env)
            .map_err(|e| e.to_string())
            .and_then(|patch| {
                AdmissionResponse::from(request)
                    .with_patch(patch)
                    .map_err(|e| e.to_string())
            });

        match patched {
            Ok(response) => ReviewOutcome {
                response,
                decision: Decision::Patched,
            },
            Err(message) => {
                error!(uid = %request.uid, error = %message, "Failed to serialize patch");
                let mut response = AdmissionResponse::from(request);
                response.result.message = message;
                ReviewOutcome {
                    response,
                    decision: Decision::PatchFailed,
                }
            }
        }
    }

    fn view(&self, request: &AdmissionRequest<DynamicObject>) -> Option<WorkloadView> {
        let uid = &request.uid;
        let kind = request.kind.kind.as_str();

        let Some(object) = &request.object else {
            warn!(uid = %uid, kind = %kind, "Missing object in request");
            return None;
        };

        let value = match serde_json::to_value(object) {
            Ok(value) => value,
            Err(e) => {
                error!(uid = %uid, kind = %kind, error = %e, "Failed to read object");
                return None;
            }
        };

        match WorkloadView::decode(kind, value) {
            Ok(view) => Some(view),
            Err(WorkloadError::UnsupportedKind(_)) => {
                debug!(uid = %uid, kind = %kind, "Unsupported kind");
                None
            }
            Err(WorkloadError::OwnedByDeployment) => {
                debug!(uid = %uid, "ReplicaSet is owned by a Deployment, skipping");
                None
            }
            Err(e) => {
                error!(uid = %uid, kind = %kind, error = %e, "Rejected workload");
                None
            }
        }
    }

    async fn namespace(&self, request: &AdmissionRequest<DynamicObject>) -> Option<Namespace> {
        let name = request.namespace.as_deref().filter(|n| !n.is_empty())?;

        match self.namespaces.get(name).await {
            Ok(namespace) => Some(namespace),
            Err(e) => {
                error!(
                    uid = %request.uid,
                    namespace = %name,
                    error = %e,
                    "Failed to get namespace by name"
                );
                if let Some(state) = &self.health_state {
                    state.metrics.record_namespace_lookup_failure();
                }
                None
            }
        }
    }
}
