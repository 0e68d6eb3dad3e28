//! Analysis endpoints.
//!
//! - `POST /api/analysis/run`: start a run (409 while one is active)
//! - `GET  /api/analysis/:run_id/status`: latest snapshot
//! - `GET  /api/analysis/:run_id/stream`: SSE progress
//! - `POST /api/analysis/:run_id/stop`: request cancellation
//! - `GET  /api/analysis/:run_id/results`: final report
//! - `GET  /api/analysis/patient/:patient_id/active`
//! - `GET  /api/analysis/patient/:patient_id/history?limit=`
//! - `GET  /api/analysis/stats`

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use axum::Json;
use tokio_stream::{Stream, StreamExt};

use crate::api::error::ApiError;
use crate::api::types::{
    ActiveAnalysisResponse, ApiContext, HistoryQuery, StartAnalysisRequest,
    StartAnalysisResponse, StopAnalysisResponse,
};
use crate::pipeline::analysis::{EngineStats, RunReport, RunSnapshot};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `POST /api/analysis/run`
pub async fn start(
    State(ctx): State<ApiContext>,
    Json(body): Json<StartAnalysisRequest>,
) -> Result<(StatusCode, Json<StartAnalysisResponse>), ApiError> {
    if body.patient_id.trim().is_empty() {
        return Err(ApiError::BadRequest("patient_id is required".into()));
    }
    let snapshot = ctx.analysis().start(body.into_run_request())?;
    Ok((StatusCode::ACCEPTED, Json(snapshot.into())))
}

/// `GET /api/analysis/:run_id/status`
pub async fn status(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(ctx.analysis().status(&run_id).await?))
}

/// `GET /api/analysis/:run_id/stream`
///
/// Catch-up snapshot first, then live updates. The stream ends after the
/// terminal event; a finished run yields only that event.
pub async fn stream(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let snapshots = ctx.analysis().stream(&run_id).await?;
    let events = snapshots.filter_map(|snapshot| snapshot_event(&snapshot).map(Ok));
    Ok(Sse::new(events).keep_alive(default_keep_alive()))
}

/// `POST /api/analysis/:run_id/stop`
pub async fn stop(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<StopAnalysisResponse>, ApiError> {
    let outcome = ctx.analysis().cancel(&run_id).await?;
    tracing::info!(run_id = %run_id, outcome = ?outcome, "Stop requested");
    Ok(Json(StopAnalysisResponse::new(run_id, outcome)))
}

/// `GET /api/analysis/:run_id/results`
pub async fn results(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<RunReport>, ApiError> {
    Ok(Json(ctx.analysis().report(&run_id).await?))
}

/// `GET /api/analysis/patient/:patient_id/active`
pub async fn active(
    State(ctx): State<ApiContext>,
    Path(patient_id): Path<String>,
) -> Json<ActiveAnalysisResponse> {
    let active = ctx.analysis().active_for_subject(&patient_id);
    Json(ActiveAnalysisResponse { patient_id, active })
}

/// `GET /api/analysis/patient/:patient_id/history`
pub async fn history(
    State(ctx): State<ApiContext>,
    Path(patient_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<RunReport>>, ApiError> {
    Ok(Json(ctx.analysis().history(&patient_id, query.limit).await?))
}

/// `GET /api/analysis/stats`
pub async fn stats(State(ctx): State<ApiContext>) -> Result<Json<EngineStats>, ApiError> {
    Ok(Json(ctx.analysis().stats().await?))
}

fn snapshot_event(snapshot: &RunSnapshot) -> Option<Event> {
    let name = if snapshot.is_terminal() {
        snapshot.status.as_str()
    } else {
        "progress"
    };
    match serde_json::to_string(snapshot) {
        Ok(data) => Some(
            Event::default()
                .event(name)
                .id(snapshot.sequence.to_string())
                .data(data),
        ),
        Err(e) => {
            tracing::warn!(run_id = %snapshot.run_id, error = %e, "Failed to encode snapshot");
            None
        }
    }
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(KEEP_ALIVE_INTERVAL)
        .text("keep-alive")
}
