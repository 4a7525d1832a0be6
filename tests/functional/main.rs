// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the admission review pipeline.
//!
//! These drive complete admission requests through the reviewer and the
//! HTTP router WITHOUT a Kubernetes cluster. Namespace lookups are served
//! by an in-memory store.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_pod_inherits_namespace_directive
//! ```
//!
//! ## Test Categories
//!
//! - **Review tests**: decisions, directive resolution and the produced patch
//! - **Security tests**: volume and security context selection per PSA level
//! - **Router tests**: the `/mutate` endpoint end to end

#[path = "../common/mod.rs"]
#[allow(dead_code)]
mod common;

mod router_tests;
mod security_tests;
