//! nsm-admission-webhook - injects Network Service Mesh sidecars into workloads.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads and resolves the configuration (fatal on error)
//! - Creates the Kubernetes client
//! - Registers the webhook in selfregister mode
//! - Starts the health server and the TLS admission server

use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info};

use nsm_admission_webhook::health::run_health_server;
use nsm_admission_webhook::registration;
use nsm_admission_webhook::webhooks::KubeNamespaceLookup;
use nsm_admission_webhook::{
    Config, ConfigResolver, HealthState, Reviewer, WebhookMode, WebhookState,
    mark_ready_when_listening, run_webhook_server, serving_tls_config,
};

/// Grace period for in-flight admission reviews to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A provider may already be installed; either way aws-lc-rs is available
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nsm_admission_webhook=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    let config = Arc::new(Config::parse());
    info!(config = ?config, "Starting nsm-admission-webhook");
    config.validate()?;

    // Resolve env, certificate and CA bundle before serving anything
    let resolver = ConfigResolver::new(config.clone());
    resolver.resolve()?;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Create shared health state
    let health_state = Arc::new(HealthState::new());

    // Start health server immediately so probes work during startup
    let health_handle = {
        let health_state = health_state.clone();
        let addr = config.health_listen_on;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Everything that can fail is built before the webhook is published
    let tls = RustlsConfig::from_config(serving_tls_config(&resolver).await?);
    let reviewer = Reviewer::from_config(
        &resolver,
        Arc::new(KubeNamespaceLookup::new(client.clone())),
    )?
    .with_health_state(health_state.clone());

    let registration = match config.webhook_mode {
        WebhookMode::SelfRegister => {
            Some(registration::register(client.clone(), &config, resolver.ca_bundle()?).await?)
        }
        WebhookMode::Spire => None,
    };

    let handle = Handle::new();
    let mut webhook_handle = {
        let state = Arc::new(WebhookState::new(reviewer));
        let addr = config.listen_on;
        let handle = handle.clone();
        tokio::spawn(async move { run_webhook_server(state, addr, tls, handle).await })
    };
    tokio::spawn(mark_ready_when_listening(
        handle.clone(),
        health_state.clone(),
    ));

    // Wait for any task to complete (or fail), or shutdown signal
    let mut result: Result<(), Box<dyn std::error::Error>> = Ok(());
    tokio::select! {
        joined = &mut webhook_handle => {
            match joined {
                Ok(Ok(())) => error!("Webhook server stopped unexpectedly"),
                Ok(Err(e)) => {
                    error!("Webhook server error: {}", e);
                    result = Err(e.into());
                }
                Err(e) => error!("Webhook server task panicked: {}", e),
            }
        }
        joined = health_handle => {
            if let Err(e) = joined {
                error!("Health server task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new requests
            health_state.set_ready(false).await;

            handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)));
            if let Ok(Err(e)) = webhook_handle.await {
                error!("Webhook server error during shutdown: {}", e);
            }
        }
    }

    if let Some(registration) = registration {
        registration.unregister().await;
    }

    info!("Webhook stopped");
    result
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the webhook cannot shut down
/// gracefully without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
