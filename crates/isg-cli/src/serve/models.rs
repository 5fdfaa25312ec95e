//! API request/response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use isg_core::gate::{CandidateRecord, Decision, GateState};
use isg_core::graph::{CandidateId, StoreStats};
use isg_core::{EngineError, GateError, StoreError, ValidationReport};

// =============================================================================
// Candidates
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub candidate_diff_id: CandidateId,
    pub state: GateState,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub candidate_diff_id: CandidateId,
    pub state: GateState,
    /// Absent until validation has finished.
    pub report: Option<ValidationReport>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision: Decision,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub candidate_diff_id: CandidateId,
    pub state: GateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_version: Option<u64>,
}

impl From<CandidateRecord> for DecisionResponse {
    fn from(record: CandidateRecord) -> Self {
        Self {
            candidate_diff_id: record.id,
            state: record.state,
            committed_version: record.committed_version,
        }
    }
}

// =============================================================================
// Versions
// =============================================================================

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub head: u64,
    pub versions: Vec<isg_core::graph::GraphVersion>,
    pub stats: StoreStats,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Engine errors mapped to HTTP statuses.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn gate_status(e: &GateError) -> StatusCode {
    match e {
        GateError::UnknownCandidate(_) => StatusCode::NOT_FOUND,
        GateError::InvalidTransition { .. } => StatusCode::CONFLICT,
        GateError::Store(e) => store_status(e),
        GateError::InvalidSubmission(_) | GateError::Pattern(_) | GateError::Config(_) => StatusCode::BAD_REQUEST,
        GateError::Retrieval(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GateError::Workspace(_) => StatusCode::CONFLICT,
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::ConcurrentWriteConflict { .. } => StatusCode::CONFLICT,
        StoreError::Database(_) | StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Gate(g) => gate_status(g),
            EngineError::Store(s) => store_status(s),
            EngineError::Config(_) | EngineError::Ingest(_) | EngineError::Pattern(_) | EngineError::Snapshot(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}
