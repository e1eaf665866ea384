//! Whizbang service host
//!
//! A runnable skeleton wiring the worker runtime to PostgreSQL and NATS:
//! - Env-driven configuration
//! - JSON tracing
//! - A catch-all routing policy (downstream services register their own
//!   policies, receptors, and perspectives on top of this skeleton)
//! - Health/readiness endpoints
//! - Graceful shutdown on Ctrl+C or SIGTERM

mod config;

use axum::{routing::get, Json, Router};
use config::ServiceConfig;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use wb_adapters::{NatsConfig, NatsTransport, PostgresWorkStore, StoreConfig};
use wb_coordinator::{CoordinatorConfig, WorkCoordinatorBuilder};
use wb_policy::PolicyEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service_config = ServiceConfig::from_env();
    let coordinator_config = CoordinatorConfig::from_env();
    let store_config = StoreConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&service_config.log_level)),
        )
        .json()
        .init();

    info!(
        service = %coordinator_config.service_name,
        poll_interval_ms = coordinator_config.polling_interval_ms,
        lease_seconds = coordinator_config.lease_seconds,
        partition_count = coordinator_config.partition_count,
        "Starting Whizbang service"
    );

    // Connect to the store.
    let pool = PgPoolOptions::new()
        .max_connections(store_config.max_connections)
        .connect(&store_config.database_url)
        .await?;
    let store = Arc::new(PostgresWorkStore::new(pool));
    info!("Database connection established");

    // Connect to NATS.
    let nats_config = NatsConfig::from_env();
    let transport = match NatsTransport::connect("nats", nats_config).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!(error = %e, "Failed to connect to NATS");
            return Err(e.into());
        }
    };

    // The host ships only the catch-all; services built on this skeleton
    // register their specific policies first.
    let default_topic = service_config.default_topic.clone();
    let engine = Arc::new(
        PolicyEngine::builder()
            .default_policy("default", move |_, cfg| {
                cfg.topic = default_topic.clone();
            })
            .build(),
    );

    let handle = WorkCoordinatorBuilder::new(store, coordinator_config, engine, transport)
        .build()
        .start()
        .await?;
    let instance_id = handle.instance_id().to_string();

    // Health server.
    let health_addr = SocketAddr::from(([0, 0, 0, 0], service_config.health_port));
    let health_instance = instance_id.clone();
    let health_service = service_config.service_name.clone();
    let health_app = Router::new()
        .route(
            "/ready",
            get(move || {
                let instance_id = health_instance.clone();
                let service = health_service.clone();
                async move {
                    Json(json!({
                        "status": "ready",
                        "service": service,
                        "instance_id": instance_id,
                    }))
                }
            }),
        )
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }));

    let health_server = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server listening");
        match tokio::net::TcpListener::bind(health_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, health_app).await {
                    error!(error = %e, "Health server error");
                }
            }
            Err(e) => error!(error = %e, "Failed to bind health server"),
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, stopping workers");

    let grace = service_config.shutdown_grace();
    if tokio::time::timeout(grace, handle.shutdown()).await.is_err() {
        warn!("Workers did not stop within the grace period");
    }
    health_server.abort();

    info!("Whizbang service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
