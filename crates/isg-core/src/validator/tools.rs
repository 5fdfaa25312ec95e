//! Tool seams for the three validation phases.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::overlay::Overlay;
use super::report::{Phase, RawDiagnostic};
use crate::graph::NodeKey;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Validation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A phase ran past its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{phase} phase exceeded its {} ms budget", budget.as_millis())]
pub struct TimeoutError {
    pub phase: Phase,
    pub budget: Duration,
}

/// Outcome of the compile-only phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutcome {
    pub success: bool,
    pub diagnostics: Vec<RawDiagnostic>,
}

/// A test to run, named the way the test harness filters it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub key: NodeKey,
    pub name: String,
}

impl TestTarget {
    /// Filter name: the key's path after the file segment.
    pub fn from_key(key: &NodeKey) -> Self {
        let name = match key.as_str().split_once("::") {
            Some((_, path)) => path.to_string(),
            None => key.as_str().to_string(),
        };
        Self { key: key.clone(), name }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestOutcome {
    pub passed: bool,
    /// Names of failing tests.
    pub failures: Vec<String>,
}

/// Phase (a): fast diagnostics over the overlaid files.
#[async_trait]
pub trait DiagnosticsChecker: Send + Sync {
    async fn diagnostics(&self, overlay: &Overlay) -> Result<Vec<RawDiagnostic>, ValidationError>;
}

/// Phase (b): compile-only build of the overlaid tree.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn build(&self, overlay: &Overlay) -> Result<BuildOutcome, ValidationError>;
}

/// Phase (c): run the selected tests against the overlaid tree.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, overlay: &Overlay, tests: &[TestTarget]) -> Result<TestOutcome, ValidationError>;
}
