use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;

use podscale_common::config::Config;
use podscale_orchestrator::circuit_breaker::CircuitBreakerRegistry;
use podscale_orchestrator::control_loop::ControlLoop;
use podscale_orchestrator::demand::{DemandOracle, HttpDemandOracle};
use podscale_orchestrator::logging;
use podscale_orchestrator::provider::{HttpProviderClient, ProviderClient};
use podscale_orchestrator::store::{PgStore, Store};

/// Shared application state accessible from axum handlers.
struct AppState {
    store: Arc<dyn Store>,
    control_loop: Arc<ControlLoop>,
    metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() {
    let cfg = Config::from_env();

    if let Err(e) = cfg.validate() {
        eprintln!("invalid configuration, refusing to start: {e}");
        std::process::exit(1);
    }

    let _log_guard = logging::init(&cfg);

    tracing::info!("podscale orchestrator starting");

    // Install Prometheus metrics recorder.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    // PostgreSQL store.
    let store = match PgStore::connect(&cfg.database_url, cfg.database_max_connections).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to PostgreSQL");
            std::process::exit(1);
        }
    };

    if let Err(e) = store.migrate().await {
        tracing::error!(error = %e, "failed to run PostgreSQL migrations");
        std::process::exit(1);
    }

    let store: Arc<dyn Store> = Arc::new(store);

    tracing::info!("datastore connected and migrated");

    // GPU provider client.
    let provider: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(
        cfg.provider_api_base_url.clone(),
        cfg.provider_api_key.clone().unwrap_or_default(),
        cfg.provider_retry.clone(),
        cfg.call_timeout(),
    ));

    // Demand oracle (optional — falls back to a raw queued-task count).
    let demand_oracle: Arc<dyn DemandOracle> = Arc::new(HttpDemandOracle::new(
        cfg.demand_oracle_url.clone(),
        cfg.call_timeout(),
    ));

    let circuit_breakers = Arc::new(CircuitBreakerRegistry::new());

    // Spawn circuit breaker metrics reporter.
    {
        let cbs = Arc::clone(&circuit_breakers);
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(30);
            loop {
                tokio::time::sleep(interval).await;
                cbs.report_metrics();
            }
        });
    }

    let control_loop = Arc::new(ControlLoop::new(
        Arc::clone(&store),
        provider,
        demand_oracle,
        circuit_breakers,
        cfg.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_handle = {
        let control_loop = Arc::clone(&control_loop);
        tokio::spawn(control_loop.run(shutdown_rx))
    };

    // Build shared state.
    let state = Arc::new(AppState {
        store,
        control_loop,
        metrics_handle,
    });

    // Build HTTP server.
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cfg.engine_port))
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(port = cfg.engine_port, "podscale orchestrator listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal());

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "HTTP server error");
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_handle.await {
        tracing::error!(error = %e, "control loop task panicked");
    }

    tracing::info!("podscale orchestrator stopped");
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C), whichever arrives first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

/// Health check endpoint. Checks the datastore connection.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": if store_ok { "healthy" } else { "unhealthy" },
        "services": {
            "store": if store_ok { "healthy" } else { "unhealthy" },
        }
    });

    (status, Json(body))
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

/// Recent cycle records, newest last — a read-only window into control loop
/// history for operators, bounded to the in-process ring buffer.
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cycles = state.control_loop.recent_cycles().await;
    Json(serde_json::json!({ "recent_cycles": cycles }))
}
