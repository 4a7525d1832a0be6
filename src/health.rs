//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the admission listener is bound)
//! - `/metrics` - Prometheus metrics endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for admission review counters (kind + decision)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReviewLabels {
    pub kind: String,
    pub decision: String,
}

impl EncodeLabelSet for ReviewLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("decision", self.decision.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-kind metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
}

impl EncodeLabelSet for KindLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Admission reviews by kind and decision
    pub admission_reviews_total: Family<ReviewLabels, Counter>,
    /// Admission review duration histogram
    pub admission_review_duration_seconds: Family<KindLabels, Histogram>,
    /// Failed or timed out namespace lookups
    pub namespace_lookup_failures_total: Counter,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let admission_reviews_total = Family::<ReviewLabels, Counter>::default();
        registry.register(
            "nsm_admission_reviews",
            "Total number of admission reviews",
            admission_reviews_total.clone(),
        );

        let admission_review_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.0005, 2.0, 14))
            });
        registry.register(
            "nsm_admission_review_duration_seconds",
            "Duration of admission reviews in seconds",
            admission_review_duration_seconds.clone(),
        );

        let namespace_lookup_failures_total = Counter::default();
        registry.register(
            "nsm_namespace_lookup_failures",
            "Total number of failed namespace lookups",
            namespace_lookup_failures_total.clone(),
        );

        Self {
            admission_reviews_total,
            admission_review_duration_seconds,
            namespace_lookup_failures_total,
            registry,
        }
    }

    /// Record a completed admission review
    pub fn record_review(&self, kind: &str, decision: &str, duration_secs: f64) {
        self.admission_reviews_total
            .get_or_create(&ReviewLabels {
                kind: kind.to_string(),
                decision: decision.to_string(),
            })
            .inc();
        self.admission_review_duration_seconds
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .observe(duration_secs);
    }

    /// Record a failed namespace lookup
    pub fn record_namespace_lookup_failure(&self) {
        self.namespace_lookup_failures_total.inc();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the admission endpoint is accepting connections
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the webhook as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the webhook is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the admission listener is bound.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on `addr`.
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    info!(addr = %addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
