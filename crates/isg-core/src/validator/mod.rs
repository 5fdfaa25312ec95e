//! Three-phase validation of staged futures.
//!
//! # Phases
//!
//! 1. Diagnostics over the overlaid files (fast, cheap)
//! 2. Compile-only build of the overlaid tree
//! 3. The tests that transitively depend on the edited rows
//!
//! Phases run in order and each one only starts when the previous passed.
//! Every phase has its own time budget. Tool failures, timeouts and
//! cancellation end the run with a failed report; they are never propagated.

mod cargo;
mod overlay;
mod report;
mod tools;
mod workspace;

pub use cargo::CargoToolchain;
pub use overlay::{EditLocation, LineOrigin, Overlay, OverlayEdit};
pub use report::{Diagnostic, DiagnosticLevel, Phase, PhaseResult, RawDiagnostic, ValidationReport};
pub use tools::{
    BuildOutcome, BuildRunner, DiagnosticsChecker, TestOutcome, TestRunner, TestTarget, TimeoutError,
    ValidationError,
};
pub use workspace::{FileChange, Workspace};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ValidatorConfig;
use crate::graph::{
    CandidateId, CodeGraphRow, FutureAction, GraphStore, NodeKey, StagedFuture, Tag, ValidationStatus,
};

/// Runs the validation phases against one of the store's candidates.
pub struct Validator {
    store: Arc<GraphStore>,
    checker: Arc<dyn DiagnosticsChecker>,
    builder: Arc<dyn BuildRunner>,
    tester: Arc<dyn TestRunner>,
    workspace: Arc<Workspace>,
    config: ValidatorConfig,
    max_per_hop: usize,
}

impl Validator {
    /// Validator backed by cargo in `config.workspace_root`.
    pub fn new(store: Arc<GraphStore>, config: ValidatorConfig, max_per_hop: usize) -> Self {
        let cargo = Arc::new(CargoToolchain::new(&config));
        Self::with_tools(store, cargo.clone(), cargo.clone(), cargo, config, max_per_hop)
    }

    pub fn with_tools(
        store: Arc<GraphStore>,
        checker: Arc<dyn DiagnosticsChecker>,
        builder: Arc<dyn BuildRunner>,
        tester: Arc<dyn TestRunner>,
        config: ValidatorConfig,
        max_per_hop: usize,
    ) -> Self {
        Self {
            store,
            checker,
            builder,
            tester,
            workspace: Arc::new(Workspace::new(&config.workspace_root)),
            config,
            max_per_hop,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// The working tree this validator reads and commits write back to.
    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Overlay of everything `candidate` staged on the current tree.
    ///
    /// The caller holds the workspace lock.
    pub async fn overlay(&self, candidate: CandidateId) -> Result<Overlay, ValidationError> {
        let futures = self.store.staged_for(candidate);
        Overlay::load(self.workspace.root(), self.overlay_edits(&futures)).await
    }

    /// Validate the future staged on a single row.
    pub async fn check(&self, row: &CodeGraphRow) -> ValidationReport {
        let Some(candidate) = row.candidate_diff_id else {
            let mut report = ValidationReport::new(CandidateId::new());
            fail(&mut report, Phase::Diagnostics, Duration::ZERO, Some(format!("{} has no staged future", row.key)));
            return report;
        };
        let futures: Vec<StagedFuture> = self
            .store
            .staged_for(candidate)
            .into_iter()
            .filter(|f| f.key == row.key)
            .collect();
        self.run(candidate, futures, &CancellationToken::new(), &|_| {}).await
    }

    /// Validate every future a candidate staged.
    ///
    /// `on_pass` is called as each phase passes.
    #[instrument(skip_all, fields(candidate = %candidate))]
    pub async fn check_candidate(
        &self,
        candidate: CandidateId,
        cancel: &CancellationToken,
        on_pass: &(dyn Fn(Phase) + Send + Sync),
    ) -> ValidationReport {
        let futures = self.store.staged_for(candidate);
        self.run(candidate, futures, cancel, on_pass).await
    }

    async fn run(
        &self,
        candidate: CandidateId,
        futures: Vec<StagedFuture>,
        cancel: &CancellationToken,
        on_pass: &(dyn Fn(Phase) + Send + Sync),
    ) -> ValidationReport {
        let mut report = ValidationReport::new(candidate);
        let keys: Vec<NodeKey> = futures.iter().map(|f| f.key.clone()).collect();
        let Some(fallback) = keys.first().cloned() else {
            fail(&mut report, Phase::Diagnostics, Duration::ZERO, Some("nothing staged".to_string()));
            return report;
        };
        report.blast_radius = self
            .store
            .blast_radius(&keys, self.max_per_hop)
            .into_iter()
            .map(|r| r.key)
            .collect();

        let started = Instant::now();
        let loaded = {
            let _tree = self.workspace.read().await;
            Overlay::load(self.workspace.root(), self.overlay_edits(&futures)).await
        };
        let overlay = match loaded {
            Ok(overlay) => overlay,
            Err(e) => {
                warn!(error = %e, "Could not build overlay");
                fail(&mut report, Phase::Diagnostics, started.elapsed(), Some(e.to_string()));
                return report;
            }
        };

        // (a) diagnostics
        let budget = Duration::from_millis(self.config.diagnostics_timeout_ms);
        let (result, elapsed) = timed(Phase::Diagnostics, budget, cancel, self.checker.diagnostics(&overlay)).await;
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                fail(&mut report, Phase::Diagnostics, elapsed, Some(e.to_string()));
                return report;
            }
        };
        let clean = !raw.iter().any(|d| d.level == DiagnosticLevel::Error);
        self.attribute(&mut report, &overlay, raw, Phase::Diagnostics, &fallback);
        if !clean {
            fail(&mut report, Phase::Diagnostics, elapsed, None);
            return report;
        }
        pass(&mut report, Phase::Diagnostics, elapsed);
        on_pass(Phase::Diagnostics);

        // (b) build
        report.phase_reached = Phase::Build;
        let budget = Duration::from_millis(self.config.build_timeout_ms);
        let (result, elapsed) = timed(Phase::Build, budget, cancel, self.builder.build(&overlay)).await;
        match result {
            Ok(outcome) => {
                self.attribute(&mut report, &overlay, outcome.diagnostics, Phase::Build, &fallback);
                if !outcome.success {
                    fail(&mut report, Phase::Build, elapsed, None);
                    return report;
                }
            }
            Err(e) => {
                fail(&mut report, Phase::Build, elapsed, Some(e.to_string()));
                return report;
            }
        }
        pass(&mut report, Phase::Build, elapsed);
        on_pass(Phase::Build);

        // (c) tests
        report.phase_reached = Phase::Tests;
        let tests = self.select_tests(&keys);
        report.tests = tests.iter().map(|t| t.key.clone()).collect();
        if tests.is_empty() {
            debug!("No dependent tests, skipping test run");
            report.tests_none_run = true;
            pass(&mut report, Phase::Tests, Duration::ZERO);
        } else {
            let budget = Duration::from_millis(self.config.test_timeout_ms);
            let (result, elapsed) = timed(Phase::Tests, budget, cancel, self.tester.run_tests(&overlay, &tests)).await;
            match result {
                Ok(outcome) if outcome.passed => pass(&mut report, Phase::Tests, elapsed),
                Ok(outcome) => {
                    for name in outcome.failures {
                        let node = tests
                            .iter()
                            .find(|t| t.name == name || name.ends_with(&t.name))
                            .map_or_else(|| fallback.clone(), |t| t.key.clone());
                        report.diagnostics.push(Diagnostic {
                            node,
                            message: format!("test {name} failed"),
                            level: DiagnosticLevel::Error,
                            code: None,
                            phase: Phase::Tests,
                        });
                    }
                    fail(&mut report, Phase::Tests, elapsed, None);
                    return report;
                }
                Err(e) => {
                    fail(&mut report, Phase::Tests, elapsed, Some(e.to_string()));
                    return report;
                }
            }
        }
        on_pass(Phase::Tests);

        report.passed = true;
        report.status = ValidationStatus::TestsOk;
        info!(
            tests = report.tests.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Validation passed"
        );
        report
    }

    fn overlay_edits(&self, futures: &[StagedFuture]) -> Vec<OverlayEdit> {
        futures
            .iter()
            .map(|future| {
                let location = match future.action {
                    FutureAction::Create => future
                        .key
                        .as_str()
                        .split_once("::")
                        .map(|(file, _)| file)
                        .filter(|file| file.ends_with(".rs"))
                        .map(|file| EditLocation::Append { file: file.to_string() }),
                    _ => {
                        let span = self.store.get_node(&future.key).and_then(|n| n.span);
                        let row = self.store.get_row(&future.key);
                        span.zip(row).map(|(span, row)| EditLocation::Span {
                            file: span.file,
                            start_line: span.start_line,
                            end_line: span.end_line,
                            expected: row.current_code,
                        })
                    }
                };
                OverlayEdit {
                    key: future.key.clone(),
                    action: future.action,
                    code: future.code.clone(),
                    location,
                }
            })
            .collect()
    }

    /// Test nodes among the edited rows and everything depending on them.
    fn select_tests(&self, keys: &[NodeKey]) -> Vec<TestTarget> {
        let mut closure = self.store.dependents_closure(keys);
        closure.extend(keys.iter().cloned());
        closure
            .into_iter()
            .filter(|key| self.store.get_node(key).is_some_and(|n| n.has_tag(Tag::Test)))
            .map(|key| TestTarget::from_key(&key))
            .collect()
    }

    /// Map post-edit tool output onto graph nodes.
    fn attribute(
        &self,
        report: &mut ValidationReport,
        overlay: &Overlay,
        raw: Vec<RawDiagnostic>,
        phase: Phase,
        fallback: &NodeKey,
    ) {
        for diagnostic in raw {
            let node = match (&diagnostic.file, diagnostic.line) {
                (Some(file), Some(line)) => match overlay.origin(file, line) {
                    LineOrigin::Edited(key) => Some(key),
                    LineOrigin::Original(line) => self.store.node_at(file, line),
                },
                _ => None,
            };
            report.diagnostics.push(Diagnostic {
                node: node.unwrap_or_else(|| fallback.clone()),
                message: diagnostic.message,
                level: diagnostic.level,
                code: diagnostic.code,
                phase,
            });
        }
    }
}

/// Run one phase under its budget, racing cancellation.
async fn timed<T>(
    phase: Phase,
    budget: Duration,
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, ValidationError>>,
) -> (Result<T, ValidationError>, Duration) {
    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ValidationError::Cancelled),
        outcome = tokio::time::timeout(budget, work) => {
            outcome.unwrap_or_else(|_| Err(TimeoutError { phase, budget }.into()))
        }
    };
    (result, started.elapsed())
}

fn pass(report: &mut ValidationReport, phase: Phase, elapsed: Duration) {
    report.phases.push(PhaseResult {
        phase,
        passed: true,
        elapsed_ms: elapsed.as_millis() as u64,
        error: None,
    });
    report.status = phase.passed_status();
}

fn fail(report: &mut ValidationReport, phase: Phase, elapsed: Duration, error: Option<String>) {
    if let Some(error) = &error {
        warn!(%phase, %error, "Validation phase did not complete");
    } else {
        info!(%phase, errors = report.error_count(), "Validation phase failed");
    }
    report.phase_reached = phase;
    report.phases.push(PhaseResult {
        phase,
        passed: false,
        elapsed_ms: elapsed.as_millis() as u64,
        error,
    });
    report.passed = false;
    report.status = ValidationStatus::Failed;
}
