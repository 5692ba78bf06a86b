pub mod handlers;
mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::storage::MetadataStore;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub store: Arc<MetadataStore>,
}

const TASK: &str = "/flows/{flow_id}/runs/{run_number}/steps/{step_name}/tasks/{task_id}";

/// Build the router over an initialized store.
pub fn router(store: Arc<MetadataStore>, max_body: usize) -> Router {
    let state = Arc::new(AppState { store });

    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/flows", get(handlers::get_flows))
        .route("/flows/{flow_id}", get(handlers::get_flow).post(handlers::create_flow))
        .route("/flows/{flow_id}/runs", get(handlers::get_runs))
        .route("/flows/{flow_id}/run", post(handlers::create_run))
        .route("/flows/{flow_id}/runs/{run_number}", get(handlers::get_run))
        .route(
            "/flows/{flow_id}/runs/{run_number}/status",
            post(handlers::update_run_status),
        )
        .route(
            "/flows/{flow_id}/runs/{run_number}/metadata",
            get(handlers::get_metadata_by_run),
        )
        .route("/flows/{flow_id}/runs/{run_number}/steps", get(handlers::get_steps))
        .route(
            "/flows/{flow_id}/runs/{run_number}/steps/{step_name}",
            get(handlers::get_step),
        )
        .route(
            "/flows/{flow_id}/runs/{run_number}/steps/{step_name}/step",
            post(handlers::create_step),
        )
        .route(
            "/flows/{flow_id}/runs/{run_number}/steps/{step_name}/tasks",
            get(handlers::get_tasks),
        )
        .route(
            "/flows/{flow_id}/runs/{run_number}/steps/{step_name}/task",
            post(handlers::create_task),
        )
        .route(TASK, get(handlers::get_task))
        .route(&format!("{TASK}/status"), post(handlers::update_task_status))
        .route(
            &format!("{TASK}/metadata"),
            get(handlers::get_metadata).post(handlers::create_metadata),
        )
        .route(&format!("{TASK}/artifacts"), get(handlers::get_artifacts))
        .route(
            &format!("{TASK}/artifacts/{{artifact_name}}"),
            get(handlers::get_artifact),
        )
        .route(
            &format!("{TASK}/artifacts/{{artifact_name}}/artifact"),
            post(handlers::create_artifact),
        )
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the REST API until Ctrl-C, then drain the pool.
pub async fn serve(host: &str, port: u16, store: Arc<MetadataStore>, max_body: usize) -> Result<()> {
    let app = router(store.clone(), max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("flowmeta API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl-C; serving until killed");
            std::future::pending::<()>().await;
        }
    }
}
