use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use pgfleet_models::{ClusterSummary, ListClustersResponse};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::controller::SharedState;

/// Shared API state
#[derive(Clone)]
pub struct AppState {
    pub clusters: SharedState,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/clusters", get(list_clusters))
        .route("/api/clusters/:namespace/:name", get(get_cluster))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Start the API server
pub async fn start_server(port: u16, state: AppState) -> Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

// ============================================================================
// Health Check
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "pgfleet-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ============================================================================
// Clusters
// ============================================================================

async fn list_clusters(State(state): State<AppState>) -> Json<ListClustersResponse> {
    let clusters = state.clusters.read().await.values().cloned().collect();
    Json(ListClustersResponse { clusters })
}

async fn get_cluster(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ClusterSummary>, AppError> {
    let summary = state
        .clusters
        .read()
        .await
        .get(&(namespace.clone(), name.clone()))
        .cloned();

    summary
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Cluster {}/{} not found", namespace, name)))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
enum AppError {
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
