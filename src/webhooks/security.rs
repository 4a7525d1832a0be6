//! Pod Security Admission level of the target namespace.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Namespace;

/// Namespace label carrying the enforced Pod Security Standard
pub const ENFORCE_LEVEL_LABEL: &str = "pod-security.kubernetes.io/enforce";

/// Pod Security Standard levels, least to most constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SecurityLevel {
    #[default]
    Privileged,
    Baseline,
    Restricted,
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "privileged" => Ok(SecurityLevel::Privileged),
            "baseline" => Ok(SecurityLevel::Baseline),
            "restricted" => Ok(SecurityLevel::Restricted),
            other => Err(format!("unknown pod security level: {}", other)),
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Privileged => write!(f, "privileged"),
            SecurityLevel::Baseline => write!(f, "baseline"),
            SecurityLevel::Restricted => write!(f, "restricted"),
        }
    }
}

impl SecurityLevel {
    /// Classify a namespace by its enforce label.
    ///
    /// An unknown namespace, a missing label or an unrecognized value all
    /// classify as `Privileged`.
    pub fn classify(namespace: Option<&Namespace>) -> Self {
        namespace
            .and_then(|ns| ns.metadata.labels.as_ref())
            .and_then(|labels| labels.get(ENFORCE_LEVEL_LABEL))
            .and_then(|level| level.parse().ok())
            .unwrap_or_default()
    }
}
