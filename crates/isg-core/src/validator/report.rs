//! Validation report types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::confidence::ConfidenceInputs;
use crate::graph::{CandidateId, NodeKey, ValidationStatus};
use crate::patterns::AntiPatternMatch;

/// Validator phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Diagnostics,
    Build,
    Tests,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Diagnostics => "diagnostics",
            Phase::Build => "build",
            Phase::Tests => "tests",
        }
    }

    /// Row status recorded when this phase passes.
    pub fn passed_status(&self) -> ValidationStatus {
        match self {
            Phase::Diagnostics => ValidationStatus::DiagnosticsOk,
            Phase::Build => ValidationStatus::BuildOk,
            Phase::Tests => ValidationStatus::TestsOk,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Note,
    Help,
}

impl DiagnosticLevel {
    /// Map a rustc level string.
    pub fn from_rustc(level: &str) -> Self {
        match level {
            l if l.starts_with("error") => DiagnosticLevel::Error,
            "warning" => DiagnosticLevel::Warning,
            "help" => DiagnosticLevel::Help,
            _ => DiagnosticLevel::Note,
        }
    }
}

/// Tool output before it is attributed to a node. Lines are post-edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDiagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl RawDiagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message: message.into(),
            code: None,
            file: None,
            line: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            ..Self::error(message)
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: usize) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A diagnostic mapped onto a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub node: NodeKey,
    pub message: String,
    pub level: DiagnosticLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub phase: Phase,
}

/// Outcome of one executed phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub passed: bool,
    pub elapsed_ms: u64,
    /// Tool failure, timeout or cancellation that ended the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured result of validating one candidate.
///
/// Always produced, including when a tool crashes or times out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub candidate: CandidateId,
    /// Last phase started.
    pub phase_reached: Phase,
    pub passed: bool,
    pub status: ValidationStatus,
    pub phases: Vec<PhaseResult>,
    pub diagnostics: Vec<Diagnostic>,
    /// Nodes reachable from the candidate's rows, most likely implicated by a failure.
    pub blast_radius: Vec<NodeKey>,
    /// Tests selected for phase (c).
    pub tests: Vec<NodeKey>,
    /// Phase (c) passed without running anything.
    pub tests_none_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_inputs: Option<ConfidenceInputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_pattern: Option<AntiPatternMatch>,
}

impl ValidationReport {
    pub fn new(candidate: CandidateId) -> Self {
        Self {
            candidate,
            phase_reached: Phase::Diagnostics,
            passed: false,
            status: ValidationStatus::Pending,
            phases: Vec::new(),
            diagnostics: Vec::new(),
            blast_radius: Vec::new(),
            tests: Vec::new(),
            tests_none_run: false,
            confidence: None,
            confidence_inputs: None,
            anti_pattern: None,
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// The phase that failed, if any.
    pub fn failed_phase(&self) -> Option<Phase> {
        self.phases.iter().find(|p| !p.passed).map(|p| p.phase)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Error)
            .count()
    }

    /// Diagnostics raised by one phase.
    pub fn diagnostics_in(&self, phase: Phase) -> usize {
        self.diagnostics.iter().filter(|d| d.phase == phase).count()
    }

    /// First tool failure recorded, if any.
    pub fn tool_error(&self) -> Option<&str> {
        self.phases.iter().find_map(|p| p.error.as_deref())
    }

    /// One line describing the outcome.
    pub fn summary(&self) -> String {
        match self.failed_phase() {
            Some(phase) => match self.tool_error() {
                Some(error) => format!("failed in {phase}: {error}"),
                None => format!("failed in {phase} with {} error(s)", self.error_count()),
            },
            None if self.passed && self.tests_none_run => "passed (no tests run)".to_string(),
            None if self.passed => format!("passed ({} test target(s))", self.tests.len()),
            None => format!("in progress ({})", self.phase_reached),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(DiagnosticLevel::from_rustc("error"), DiagnosticLevel::Error);
        assert_eq!(
            DiagnosticLevel::from_rustc("error: internal compiler error"),
            DiagnosticLevel::Error
        );
        assert_eq!(DiagnosticLevel::from_rustc("warning"), DiagnosticLevel::Warning);
        assert_eq!(DiagnosticLevel::from_rustc("failure-note"), DiagnosticLevel::Note);
    }

    #[test]
    fn test_summary() {
        let mut report = ValidationReport::new(CandidateId::new());
        report.phases.push(PhaseResult {
            phase: Phase::Diagnostics,
            passed: true,
            elapsed_ms: 3,
            error: None,
        });
        report.phases.push(PhaseResult {
            phase: Phase::Build,
            passed: false,
            elapsed_ms: 40,
            error: Some("build phase exceeded its 3000 ms budget".to_string()),
        });
        assert_eq!(report.failed_phase(), Some(Phase::Build));
        assert!(report.summary().starts_with("failed in build"));
    }
}
