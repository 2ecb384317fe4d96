//! Careforge API Gateway
//!
//! The administrative surface of the document workflow:
//! - Create documents and drive them through the pipeline
//! - Fetch lifecycle state and embedded signing URLs
//! - Accept signature status callbacks
//! - Run comparison queries and trigger re-indexing

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use careforge_common::{
    bootstrap,
    config::AppConfig,
    index::plans,
    metrics,
    workflow::{sweep, Orchestrator},
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, Level};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .json()
        .init();

    info!("Starting Careforge API Gateway v{}", careforge_common::VERSION);

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        e
    })?;

    let config = Arc::new(config);

    // Initialize metrics
    metrics::register_metrics();
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                metrics::ADAPTER_BUCKETS,
            )?
            .install()?;
        info!(port = config.observability.metrics_port, "Metrics exporter listening");
    }

    // Assemble the orchestrator and its adapters
    let services = bootstrap::build(&config).await?;
    let orchestrator = services.orchestrator;

    // Seed reference insurance plans into the comparison index
    if let Some(ref path) = config.index.reference_plans_file {
        let loaded = plans::load_reference_plans(path).await?;
        orchestrator.index_reference_plans(&loaded).await?;
    }

    // With the in-process store there is no separate worker; run the
    // status sweep here.
    if config.database.backend == "memory" {
        let sweeper = orchestrator.clone();
        let workflow = config.workflow.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(workflow.poll_interval());
            loop {
                interval.tick().await;
                if let Err(e) = sweep::run_sweep(&sweeper, workflow.poll_concurrency).await {
                    error!(error = %e, "Status sweep failed");
                }
            }
        });
        info!(
            interval_secs = config.workflow.poll_interval_secs,
            "In-process status sweep started"
        );
    }

    // Create app state
    let state = AppState {
        config: config.clone(),
        orchestrator,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        // Document endpoints
        .route("/documents", post(handlers::documents::create_document))
        .route("/documents", get(handlers::documents::list_documents))
        .route("/documents/{id}", get(handlers::documents::get_document))
        .route(
            "/documents/{id}/signing-url",
            get(handlers::documents::signing_url),
        )
        .route(
            "/documents/{id}/status",
            post(handlers::documents::apply_status),
        )
        .route("/documents/{id}/fail", post(handlers::documents::fail_document))
        // Comparison endpoints
        .route("/compare", post(handlers::comparisons::compare))
        .route("/reindex", post(handlers::comparisons::reindex));

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
