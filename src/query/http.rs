//! HTTP surface for dashboards
//!
//! - `GET /sessions`
//! - `GET /sessions/:id/snapshot`
//! - `GET /sessions/:id/windows[?car=]`
//! - `GET /sessions/:id/cars/:car/metrics/:metric`
//! - `GET /metrics`
//!
//! Every body carries `pollIntervalMs` so dashboards poll at the configured rate.

use super::gateway::{QueryError, QueryGateway};
use crate::feed_core::reader::{FeedStats, FeedStatsSnapshot};
use crate::pipeline::metrics::{IngestMetrics, IngestMetricsSnapshot};
use crate::publisher::event_publisher::{PublisherStats, PublisherStatsSnapshot};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared handler state.
pub struct ApiState {
    pub gateway: QueryGateway,
    pub poll_interval_ms: u64,
    pub ingest: Arc<IngestMetrics>,
    pub publisher: Option<Arc<PublisherStats>>,
    pub feed: Option<Arc<FeedStats>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T: Serialize> {
    poll_interval_ms: u64,
    data: T,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    poll_interval_ms: u64,
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsBody {
    ingest: IngestMetricsSnapshot,
    publisher: Option<PublisherStatsSnapshot>,
    feed: Option<FeedStatsSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct WindowFilter {
    pub car: Option<String>,
}

struct ApiError {
    status: StatusCode,
    message: String,
    poll_interval_ms: u64,
}

impl ApiError {
    fn from_query(err: QueryError, poll_interval_ms: u64) -> Self {
        let status = match err {
            QueryError::UnknownSession(_) | QueryError::NotFound { .. } => StatusCode::NOT_FOUND,
            QueryError::Archive(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("❌ Query failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
            poll_interval_ms,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            poll_interval_ms: self.poll_interval_ms,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn respond<T: Serialize>(state: &ApiState, result: Result<T, QueryError>) -> ApiResult<T> {
    result
        .map(|data| {
            Json(Envelope {
                poll_interval_ms: state.poll_interval_ms,
                data,
            })
        })
        .map_err(|e| ApiError::from_query(e, state.poll_interval_ms))
}

async fn list_sessions(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    respond(&state, state.gateway.sessions().await)
}

async fn session_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    respond(&state, state.gateway.session_snapshot(&session_id).await)
}

async fn session_windows(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
    Query(filter): Query<WindowFilter>,
) -> impl IntoResponse {
    respond(
        &state,
        state.gateway.window_aggregates(&session_id, filter.car.as_deref()).await,
    )
}

async fn metric_value(
    State(state): State<Arc<ApiState>>,
    Path((session_id, car_number, metric_name)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(
        &state,
        state.gateway.get_state(&session_id, &car_number, &metric_name).await,
    )
}

async fn metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let body = MetricsBody {
        ingest: state.ingest.snapshot(),
        publisher: state.publisher.as_ref().map(|p| p.snapshot()),
        feed: state.feed.as_ref().map(|f| f.snapshot()),
    };
    respond(&state, Ok(body))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id/snapshot", get(session_snapshot))
        .route("/sessions/:id/windows", get(session_windows))
        .route("/sessions/:id/cars/:car/metrics/:metric", get(metric_value))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("🌐 Query API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
