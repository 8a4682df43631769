//! Admin HTTP API
//!
//! Thin JSON surface over a running node: submit tasks, read their merged
//! statuses and inspect cluster records and routes. Task and cluster routes
//! need a record store and answer 503 on nodes without one.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use canopy_cluster::{
    ClusterError, ClusterNode, ClusterRecord, ControlMessage, Destination, RecordStore, RoutingSnapshot,
    TaskRecord,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub selector: String,
    pub destination: String,
    #[serde(default)]
    pub body: String,
}

pub fn router(node: Arc<ClusterNode>) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(get_task))
        .route("/clusters", get(list_clusters))
        .route("/routes", get(routes))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

fn store(node: &ClusterNode) -> Result<&Arc<dyn RecordStore>, StatusCode> {
    node.store().ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn submit_task(
    State(node): State<Arc<ClusterNode>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<ControlMessage>), StatusCode> {
    let destination = Destination::from(request.destination);
    match node.submit(request.selector, destination, request.body).await {
        Ok(message) => Ok((StatusCode::CREATED, Json(message))),
        Err(ClusterError::Config(reason)) => {
            tracing::debug!(%reason, "Rejected task submission");
            Err(StatusCode::BAD_REQUEST)
        }
        Err(e) => {
            tracing::error!(error = %e, "Task submission failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_task(
    State(node): State<Arc<ClusterNode>>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, StatusCode> {
    let store = store(&node)?;
    match store.get_task(&node.config().namespace, &id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(error = %e, task = %id, "Task lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn list_clusters(State(node): State<Arc<ClusterNode>>) -> Result<Json<Vec<ClusterRecord>>, StatusCode> {
    let store = store(&node)?;
    store
        .list_clusters(&node.config().namespace)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!(error = %e, "Cluster listing failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn routes(State(node): State<Arc<ClusterNode>>) -> Json<RoutingSnapshot> {
    Json(node.routing_snapshot())
}

async fn health() -> &'static str {
    "ok"
}
