use thiserror::Error;

use super::state::GateState;
use crate::config::ConfigError;
use crate::graph::{CandidateId, StoreError};
use crate::patterns::PatternError;
use crate::retrieval::RetrievalError;
use crate::validator::ValidationError;

/// Errors that can occur in safety gate operations.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Unknown candidate: {0}")]
    UnknownCandidate(CandidateId),

    #[error("Candidate {candidate} cannot move from {from} to {to}")]
    InvalidTransition {
        candidate: CandidateId,
        from: GateState,
        to: GateState,
    },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("Workspace write-back failed: {0}")]
    Workspace(#[from] ValidationError),
}

impl GateError {
    /// True for a lost commit race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, GateError::Store(e) if e.is_conflict())
    }
}
