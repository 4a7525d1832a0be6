//! Effective injection directive for a workload.

use k8s_openapi::api::core::v1::Namespace;

use super::workload::WorkloadKind;

/// Non-empty value of annotation `key` on a namespace.
pub fn namespace_annotation<'a>(namespace: &'a Namespace, key: &str) -> Option<&'a str> {
    namespace
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Whether the namespace has to be consulted to resolve the directive.
pub fn needs_namespace_fallback(kind: WorkloadKind, own: Option<&str>) -> bool {
    own.is_none_or(str::is_empty) && kind.is_pod()
}

/// Resolve the directive for a workload.
///
/// The workload's own value always wins. Only bare pods inherit the
/// namespace's value; controllers must declare their own intent.
pub fn resolve_annotation(
    kind: WorkloadKind,
    own: Option<&str>,
    namespace: Option<&Namespace>,
    key: &str,
) -> Option<String> {
    if let Some(own) = own.filter(|v| !v.is_empty()) {
        return Some(own.to_string());
    }
    if !kind.is_pod() {
        return None;
    }
    namespace
        .and_then(|ns| namespace_annotation(ns, key))
        .map(str::to_string)
}
