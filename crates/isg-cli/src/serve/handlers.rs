//! HTTP route handlers for the API server.
//!
//! Handlers are kept thin, delegating to the engine.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use isg_core::gate::{CandidateRecord, CandidateSubmission};
use isg_core::graph::{CandidateId, IngestOutcome};
use isg_core::{ingest, QueryRequest, Shortlist};

use super::models::{ApiError, DecisionRequest, DecisionResponse, ReportResponse, SubmitResponse, VersionsResponse};
use super::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_id(id: &str) -> Result<CandidateId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::bad_request(format!("not a candidate id: {id}")))
}

// =============================================================================
// Graph
// =============================================================================

/// POST `/api/ingest` - Upsert a batch of nodes and edges.
pub async fn ingest(State(state): State<Arc<AppState>>, body: String) -> ApiResult<IngestOutcome> {
    let batch = ingest::parse_batch(&body).map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(state.engine.ingest(batch).await?))
}

/// POST `/api/query` - Ranked context shortlist.
///
/// ```json
/// { "seed_keys": ["src/lib.rs::parse"], "hints": ["retry"], "token_budget": 2000 }
/// ```
pub async fn query(State(state): State<Arc<AppState>>, Json(request): Json<QueryRequest>) -> ApiResult<Shortlist> {
    Ok(Json(state.engine.query(request).await?))
}

/// GET `/api/versions` - Retained graph versions, oldest first.
pub async fn versions(State(state): State<Arc<AppState>>) -> ApiResult<VersionsResponse> {
    let stats = state.engine.stats();
    Ok(Json(VersionsResponse {
        head: stats.head,
        versions: state.engine.versions(),
        stats,
    }))
}

// =============================================================================
// Candidates
// =============================================================================

/// POST `/api/candidates` - Stage a candidate and start validating it.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<CandidateSubmission>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let id = state.engine.submit(submission).await?;
    let gate_state = state.engine.gate().state(id).map_err(isg_core::EngineError::from)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            candidate_diff_id: id,
            state: gate_state,
        }),
    ))
}

/// GET `/api/candidates/{id}` - Full candidate record with its state history.
pub async fn candidate(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<CandidateRecord> {
    let id = parse_id(&id)?;
    let record = state.engine.gate().record(id).map_err(isg_core::EngineError::from)?;
    Ok(Json(record))
}

/// GET `/api/candidates/{id}/report` - Poll for the validation report.
pub async fn report(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<ReportResponse> {
    let id = parse_id(&id)?;
    let report = state.engine.get_report(id)?;
    let gate_state = state.engine.gate().state(id).map_err(isg_core::EngineError::from)?;
    Ok(Json(ReportResponse {
        candidate_diff_id: id,
        state: gate_state,
        report,
    }))
}

/// POST `/api/candidates/{id}/decision` - Approve or reject.
///
/// ```json
/// { "decision": "approve" }
/// ```
pub async fn decide(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<DecisionResponse> {
    let id = parse_id(&id)?;
    let record = state.engine.decide(id, request.decision).await?;
    Ok(Json(record.into()))
}
