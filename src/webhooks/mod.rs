//! Mutating admission webhook that injects Network Service Mesh sidecars.
//!
//! A review flows through:
//! - [`workload`]: decode the object by kind into a uniform view
//! - [`annotation`]: resolve the injection directive, with namespace fallback for pods
//! - [`security`]: classify the namespace's Pod Security level
//! - [`mutation`]: build the JSON Patch

pub mod annotation;
pub mod mutation;
pub mod namespace;
pub mod review;
pub mod security;
mod server;
pub mod workload;

pub use namespace::{KubeNamespaceLookup, NamespaceLookup, NamespaceLookupError};
pub use review::{Decision, ReviewOutcome, Reviewer};
pub use security::SecurityLevel;
pub use server::{WebhookError, WebhookState, create_webhook_router, run_webhook_server};
pub use workload::{WorkloadError, WorkloadKind, WorkloadView};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
