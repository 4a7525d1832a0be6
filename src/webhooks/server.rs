//! Admission webhook server.
//!
//! Serves `POST /mutate` and `GET /ready` over TLS. The serving certificate
//! is resolved at startup, see [`crate::tls`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{error, info};

use super::review::Reviewer;

/// Shared state for webhook handlers
pub struct WebhookState {
    pub reviewer: Reviewer,
}

impl WebhookState {
    pub fn new(reviewer: Reviewer) -> Self {
        Self { reviewer }
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .route("/ready", get(ready))
        .with_state(state)
}

/// Mutating admission handler
async fn mutate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    let outcome = state.reviewer.review(&request).await;
    (StatusCode::OK, Json(outcome.response.into_review()))
}

/// Liveness handler for the TLS listener
async fn ready() -> StatusCode {
    StatusCode::OK
}

/// Errors that can occur when running the webhook server
#[derive(Debug)]
pub enum WebhookError {
    /// TLS configuration error
    TlsConfig(String),
    /// Server error
    Server(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::TlsConfig(msg) => write!(f, "TLS configuration error: {}", msg),
            WebhookError::Server(msg) => write!(f, "Webhook server error: {}", msg),
        }
    }
}

impl std::error::Error for WebhookError {}

impl From<crate::tls::TlsError> for WebhookError {
    fn from(e: crate::tls::TlsError) -> Self {
        WebhookError::TlsConfig(e.to_string())
    }
}

/// Run the webhook server with TLS on `addr` until `handle` shuts it down.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    tls: RustlsConfig,
    handle: Handle,
) -> Result<(), WebhookError> {
    let app = create_webhook_router(state);

    info!(addr = %addr, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
