//! HTTP API for the resharding coordinator
//!
//! - `POST /reshard` admits an operation
//! - `PUT /reshard/:id/assignment` supplies the planner's ranges
//! - `POST /reshard/:id/participants` carries participant state reports
//! - `POST /reshard/:id/abort` requests an abort before commit
//! - `GET /reshard`, `GET /reshard/:id`, `GET /reshard/:id/wait` for status
//! - `GET /reshard/events` streams phase changes over SSE

use crate::common::metrics::METRICS;
use crate::common::Error;
use crate::coordinator::machine::CompletionOutcome;
use crate::coordinator::record::{
    OperationId, OperationRecord, ParticipantDescriptor, PartitionAssignment, ReshardRequest,
};
use crate::coordinator::service::ReshardingService;
use async_stream::stream;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct CoordState {
    pub service: Arc<ReshardingService>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, Error>;

/// Body of `POST /reshard`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReshardRequest {
    #[serde(flatten)]
    pub request: ReshardRequest,
    #[serde(default)]
    pub assignment: Option<PartitionAssignment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `GET /reshard/:id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub record: OperationRecord,
    pub outcome: Option<CompletionOutcome>,
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/reshard", post(start_reshard).get(list_operations))
        .route("/reshard/events", get(phase_events))
        .route("/reshard/:id", get(get_operation))
        .route("/reshard/:id/assignment", put(set_assignment))
        .route("/reshard/:id/participants", post(participant_update))
        .route("/reshard/:id/abort", post(abort_operation))
        .route("/reshard/:id/wait", get(wait_operation))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

async fn start_reshard(
    State(state): State<CoordState>,
    Json(body): Json<StartReshardRequest>,
) -> ApiResult<impl IntoResponse> {
    let coordinator = state
        .service
        .start_operation(body.request, body.assignment)?;
    Ok((StatusCode::CREATED, Json(coordinator.record())))
}

async fn list_operations(State(state): State<CoordState>) -> Json<Vec<OperationRecord>> {
    Json(state.service.list())
}

async fn get_operation(
    State(state): State<CoordState>,
    Path(id): Path<OperationId>,
) -> ApiResult<Json<OperationStatus>> {
    let coordinator = state.service.get(&id)?;
    Ok(Json(OperationStatus {
        record: coordinator.record(),
        outcome: coordinator.try_completion(),
    }))
}

async fn set_assignment(
    State(state): State<CoordState>,
    Path(id): Path<OperationId>,
    Json(assignment): Json<PartitionAssignment>,
) -> ApiResult<StatusCode> {
    state
        .service
        .get(&id)?
        .set_partition_assignment(assignment)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn participant_update(
    State(state): State<CoordState>,
    Path(id): Path<OperationId>,
    Json(descriptor): Json<ParticipantDescriptor>,
) -> ApiResult<StatusCode> {
    state.service.get(&id)?.on_participant_update(descriptor)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn abort_operation(
    State(state): State<CoordState>,
    Path(id): Path<OperationId>,
    body: Option<Json<AbortRequest>>,
) -> ApiResult<StatusCode> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "aborted by user".to_string());
    state.service.get(&id)?.abort(reason)?;
    Ok(StatusCode::ACCEPTED)
}

async fn wait_operation(
    State(state): State<CoordState>,
    Path(id): Path<OperationId>,
) -> ApiResult<Json<CompletionOutcome>> {
    Ok(Json(state.service.wait(&id).await?))
}

/// SSE stream of phase changes
async fn phase_events(
    State(state): State<CoordState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.service.subscribe_events();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(data) => yield Ok(Event::default().event("phase").data(data)),
                    Err(e) => tracing::warn!("cannot encode phase event: {}", e),
                },
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("phase event subscriber lagged by {}", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "holds_lease": state.service.holds_lease(),
        "operations_in_flight": METRICS.operations_in_flight.get(),
        "uptime_seconds": METRICS.uptime_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
