use crate::app::AppState;
use crate::call::{CallOutcome, CallRecord, CALLS_TABLE};
use crate::call::DialRequest;
use crate::error::Error;
use crate::insight::CallStats;
use crate::storage::Filter;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

pub mod ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/calls", post(dial).get(list_active))
        .route("/api/calls/{id}/cancel", post(cancel_call))
        .route("/api/calls/{id}/disposition", post(record_disposition))
        .route("/api/calls/{id}/analysis", post(submit_analysis))
        .route("/api/analysis/in_flight", get(list_in_flight))
        .route("/api/insight", post(summarize))
        .route("/ws", get(ws::ws_handler))
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NoRecording { .. } => StatusCode::BAD_REQUEST,
            Error::Gateway { .. } | Error::Dispatch { .. } | Error::InsightExhausted { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Error::Store { .. } | Error::ReconciliationConflict { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn dial(
    State(state): State<AppState>,
    Json(req): Json<DialRequest>,
) -> Result<Response, Error> {
    let provider_call_id = state.sessions.dial(req).await?;
    Ok(Json(json!({ "provider_call_id": provider_call_id })).into_response())
}

async fn list_active(State(state): State<AppState>) -> Response {
    let calls = state.sessions.active_calls().await;
    Json(json!({ "calls": calls })).into_response()
}

async fn cancel_call(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let cancelled = state.sessions.cancel(&id).await;
    if cancelled {
        info!(provider_call_id = id, "call cancelled by request");
    }
    Json(cancelled).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DispositionRequest {
    pub outcome: CallOutcome,
    pub notes: Option<String>,
    pub follow_up_at: Option<DateTime<Utc>>,
}

async fn record_disposition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DispositionRequest>,
) -> Result<Response, Error> {
    state
        .reconciler
        .record_disposition(&id, req.outcome, req.notes, req.follow_up_at)
        .await?;
    Ok(Json(true).into_response())
}

async fn submit_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    let row = state
        .store
        .select_one(CALLS_TABLE, &Filter::new().eq("provider_call_id", &id))
        .await?
        .ok_or_else(|| {
            Error::store(
                CALLS_TABLE,
                anyhow::anyhow!("no call record for provider call id {}", id),
            )
        })?;
    let record: CallRecord = serde_json::from_value(row)
        .map_err(|e| Error::store(CALLS_TABLE, anyhow::anyhow!("decode call record: {}", e)))?;
    let handle = state.pipeline.submit(&record).await?;
    Ok(Json(handle).into_response())
}

async fn list_in_flight(State(state): State<AppState>) -> Result<Response, Error> {
    // refresh first so settled analyses drop out of the indicator set
    state.pipeline.sync_in_flight().await?;
    Ok(Json(json!({ "call_ids": state.pipeline.in_flight() })).into_response())
}

async fn summarize(
    State(state): State<AppState>,
    Json(stats): Json<CallStats>,
) -> Result<Response, Error> {
    let summary = state.insight.summarize(&stats).await?;
    Ok(Json(summary).into_response())
}
