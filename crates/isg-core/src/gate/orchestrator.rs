//! The safety gate: the only path from a candidate to `current_code`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Mutex as RowLock, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::candidate::{CandidateRecord, CandidateSubmission, Decision};
use super::error::GateError;
use super::state::GateState;
use crate::config::GateConfig;
use crate::confidence::{self, ConfidenceInputs};
use crate::embedder::Embedder;
use crate::graph::{CandidateId, FutureAction, GraphDb, GraphStore, GraphVersion, NodeKey, ValidationStatus};
use crate::patterns::{AntiPatternMatch, OutcomeEvent, PatternError, PatternLibrary, Severity};
use crate::retrieval::{HybridRetriever, TokenBudget};
use crate::validator::{Phase, ValidationReport, Validator};

struct Slot {
    record: CandidateRecord,
    cancel: CancellationToken,
    state_tx: watch::Sender<GateState>,
    committing: bool,
}

struct GateInner {
    store: Arc<GraphStore>,
    patterns: Arc<PatternLibrary>,
    embedder: Arc<dyn Embedder>,
    retriever: Arc<HybridRetriever>,
    validator: Arc<Validator>,
    db: Option<Arc<GraphDb>>,
    workers: Arc<Semaphore>,
    candidates: RwLock<HashMap<CandidateId, Slot>>,
    row_locks: Mutex<HashMap<NodeKey, Arc<RowLock<()>>>>,
}

/// Drives candidates from submission to commit or rollback.
///
/// Cheap to clone; clones share the same candidates.
#[derive(Clone)]
pub struct SafetyGate {
    inner: Arc<GateInner>,
}

impl SafetyGate {
    pub fn new(
        store: Arc<GraphStore>,
        patterns: Arc<PatternLibrary>,
        embedder: Arc<dyn Embedder>,
        retriever: Arc<HybridRetriever>,
        validator: Arc<Validator>,
        db: Option<Arc<GraphDb>>,
        config: &GateConfig,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                store,
                patterns,
                embedder,
                retriever,
                validator,
                db,
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                candidates: RwLock::new(HashMap::new()),
                row_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Stage a candidate and validate it in the background.
    #[instrument(skip_all, fields(targets = submission.target_keys.len()))]
    pub async fn submit(&self, submission: CandidateSubmission) -> Result<CandidateId, GateError> {
        let id = self.prepare(submission)?;
        let gate = self.clone();
        tokio::spawn(async move {
            gate.run_validation(id).await;
        });
        Ok(id)
    }

    /// Stage a candidate and validate it before returning.
    #[instrument(skip_all, fields(targets = submission.target_keys.len()))]
    pub async fn validate(&self, submission: CandidateSubmission) -> Result<(CandidateId, ValidationReport), GateError> {
        let id = self.prepare(submission)?;
        let report = self.run_validation(id).await;
        Ok((id, report))
    }

    /// Roll back a failed candidate and submit its replacement.
    #[instrument(skip(self, submission), fields(candidate = %id))]
    pub async fn refine(&self, id: CandidateId, mut submission: CandidateSubmission) -> Result<CandidateId, GateError> {
        let state = self.state(id)?;
        if state != GateState::Failed {
            return Err(GateError::InvalidTransition {
                candidate: id,
                from: state,
                to: GateState::RolledBack,
            });
        }
        self.rollback(id).await?;
        submission.refines = Some(id);
        self.submit(submission).await
    }

    /// Check a submission, register it and write its futures.
    fn prepare(&self, submission: CandidateSubmission) -> Result<CandidateId, GateError> {
        submission.check()?;
        if let Some(unknown) = submission
            .patterns_used
            .iter()
            .find(|p| !self.inner.patterns.contains(p))
        {
            return Err(PatternError::UnknownPattern(unknown.clone()).into());
        }
        if let Some(refined) = submission.refines {
            if !self.inner.candidates.read().contains_key(&refined) {
                return Err(GateError::UnknownCandidate(refined));
            }
        }

        let id = CandidateId::new();
        let entries = submission.entries();
        let (state_tx, _) = watch::channel(GateState::Proposed);
        self.inner.candidates.write().insert(
            id,
            Slot {
                record: CandidateRecord::new(id, submission),
                cancel: CancellationToken::new(),
                state_tx,
                committing: false,
            },
        );

        if let Err(e) = self.inner.store.stage(id, entries) {
            self.inner.candidates.write().remove(&id);
            return Err(e.into());
        }
        self.transition(id, GateState::Validating)?;
        info!(candidate = %id, "Candidate staged");
        Ok(id)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    async fn run_validation(&self, id: CandidateId) -> ValidationReport {
        let Some((cancel, keys)) = self.with_slot(id, |slot| {
            (slot.cancel.clone(), slot.record.submission.target_keys.clone())
        }) else {
            return ValidationReport::new(id);
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.inner.workers).acquire_owned() => permit.ok(),
        };
        let rows = self.lock_rows(&keys, &cancel).await;

        let on_pass = |phase: Phase| {
            self.inner.store.set_validation_status(id, phase.passed_status());
            if let Err(e) = self.transition(id, GateState::after(phase)) {
                warn!(candidate = %id, error = %e, "Could not record phase");
            }
        };
        let mut report = self.inner.validator.check_candidate(id, &cancel, &on_pass).await;

        // Rows are free again before the candidate waits on approval.
        drop(rows);
        self.prune_row_locks();

        self.score(id, &mut report).await;
        drop(permit);

        let next = if report.passed {
            GateState::AwaitingApproval
        } else {
            self.inner.store.set_validation_status(id, ValidationStatus::Failed);
            GateState::Failed
        };
        self.with_slot_mut(id, |slot| slot.record.report = Some(report.clone()));
        if let Err(e) = self.transition(id, next) {
            warn!(candidate = %id, error = %e, "Could not settle candidate");
        }
        info!(candidate = %id, state = %next, summary = %report.summary(), "Validation settled");
        report
    }

    /// Take the row locks in key order, giving up on cancellation.
    async fn lock_rows(&self, keys: &[NodeKey], cancel: &CancellationToken) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let handles: Vec<Arc<RowLock<()>>> = {
            let mut locks = self.inner.row_locks.lock();
            sorted
                .iter()
                .map(|k| Arc::clone(locks.entry(k.clone()).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                guard = handle.lock_owned() => guards.push(guard),
            }
        }
        guards
    }

    fn prune_row_locks(&self) {
        self.inner
            .row_locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Attach the confidence score and any anti-pattern match.
    async fn score(&self, id: CandidateId, report: &mut ValidationReport) {
        let Some(submission) = self.with_slot(id, |slot| slot.record.submission.clone()) else {
            return;
        };

        let passed = |phase| report.phase(phase).is_some_and(|p| p.passed);
        let static_precheck = if passed(Phase::Diagnostics) && passed(Phase::Build) { 1.0 } else { 0.0 };
        let inputs = ConfidenceInputs {
            coverage: self.coverage(&submission, &report.blast_radius).await,
            agreement: self.agreement(&submission),
            consistency: confidence::consistency(
                report.diagnostics_in(Phase::Diagnostics),
                self.inner.validator.config().diagnostic_norm,
            ),
            static_precheck,
        };
        report.confidence = Some(inputs.score());
        report.confidence_inputs = Some(inputs);
        report.anti_pattern = self.anti_pattern(&submission).await;
        debug!(candidate = %id, confidence = inputs.score(), "Scored candidate");
    }

    async fn coverage(&self, submission: &CandidateSubmission, blast_radius: &[NodeKey]) -> f32 {
        let present = match &submission.context_keys {
            Some(keys) => keys.clone(),
            None => {
                let budget = i64::try_from(self.inner.retriever.config().default_token_budget)
                    .ok()
                    .and_then(|t| TokenBudget::new(t).ok())
                    .unwrap_or_default();
                match self
                    .inner
                    .retriever
                    .retrieve(submission.target_keys.clone(), Vec::new(), budget)
                    .await
                {
                    Ok(shortlist) => shortlist.keys(),
                    Err(e) => {
                        warn!(error = %e, "Retrieval for coverage failed");
                        Vec::new()
                    }
                }
            }
        };
        confidence::coverage(blast_radius, &present)
    }

    /// Fraction of the candidate's group proposing the same edit.
    fn agreement(&self, submission: &CandidateSubmission) -> f32 {
        let Some(group) = &submission.group else {
            return 1.0;
        };
        let fingerprint = submission.fingerprint();
        let candidates = self.inner.candidates.read();
        let (same, total) = candidates
            .values()
            .filter(|slot| slot.record.submission.group.as_ref() == Some(group))
            .fold((0usize, 0usize), |(same, total), slot| {
                let matches = slot.record.submission.fingerprint() == fingerprint;
                (same + usize::from(matches), total + 1)
            });
        if total == 0 {
            1.0
        } else {
            same as f32 / total as f32
        }
    }

    async fn anti_pattern(&self, submission: &CandidateSubmission) -> Option<AntiPatternMatch> {
        if submission.future_action == FutureAction::Delete {
            return None;
        }
        match self.inner.embedder.embed_one(&submission.combined_code()).await {
            Ok(vector) => self
                .inner
                .patterns
                .nearest_anti_pattern(&vector)
                .filter(|m| m.severity != Severity::Low),
            Err(e) => {
                warn!(error = %e, "Could not embed candidate code");
                None
            }
        }
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    /// Apply an external decision and return the updated record.
    pub async fn decide(&self, id: CandidateId, decision: Decision) -> Result<CandidateRecord, GateError> {
        match decision {
            Decision::Approve => {
                self.approve(id).await?;
            }
            Decision::Reject => self.rollback(id).await?,
        }
        self.record(id)
    }

    /// Commit an approved candidate: flip its rows and credit its patterns.
    #[instrument(skip(self), fields(candidate = %id))]
    pub async fn approve(&self, id: CandidateId) -> Result<GraphVersion, GateError> {
        let (submission, confidence) = {
            let mut candidates = self.inner.candidates.write();
            let slot = candidates.get_mut(&id).ok_or(GateError::UnknownCandidate(id))?;
            if slot.record.state != GateState::AwaitingApproval || slot.committing {
                return Err(GateError::InvalidTransition {
                    candidate: id,
                    from: slot.record.state,
                    to: GateState::Committed,
                });
            }
            slot.committing = true;
            (slot.record.submission.clone(), slot.record.confidence().unwrap_or(0.0))
        };

        let version = match self.write_back(id, &submission).await {
            Ok(version) => version,
            Err(e) => {
                self.with_slot_mut(id, |slot| slot.committing = false);
                warn!(error = %e, "Commit refused");
                return Err(e);
            }
        };

        let events = self.record_outcomes(id, &submission.patterns_used, true, confidence);
        self.with_slot_mut(id, |slot| {
            slot.committing = false;
            slot.record.committed_version = Some(version.number);
        });
        self.transition(id, GateState::Committed)?;
        info!(version = version.number, "Candidate committed");

        self.persist(&events).await;
        Ok(version)
    }

    /// Write the candidate into the working tree and commit its rows.
    ///
    /// The files are put back when the commit loses a race.
    async fn write_back(&self, id: CandidateId, submission: &CandidateSubmission) -> Result<GraphVersion, GateError> {
        let workspace = self.inner.validator.workspace();
        let _tree = workspace.write().await;
        self.inner.store.ensure_current(id, &submission.target_keys)?;

        let overlay = self.inner.validator.overlay(id).await?;
        let written = workspace.apply(&overlay).await?;
        let summary = submission.describe(id);
        match self
            .inner
            .store
            .commit_version(id, &submission.target_keys, &summary, &overlay.rewrites())
        {
            Ok(version) => {
                workspace.record(version.number, written);
                Ok(version)
            }
            Err(e) => {
                if let Err(undo) = workspace.undo(&written).await {
                    warn!(error = %undo, "Could not restore workspace after a refused commit");
                }
                Err(e.into())
            }
        }
    }

    /// Move the graph head back to `version` and restore the files that
    /// later commits wrote.
    #[instrument(skip(self))]
    pub async fn rollback_to(&self, version: u64) -> Result<(), GateError> {
        let workspace = self.inner.validator.workspace();
        let _tree = workspace.write().await;
        self.inner.store.ensure_rollback(version)?;
        workspace.ensure_reachable(version)?;
        let head = self.inner.store.head();

        let reverted = workspace.revert_after(version).await?;
        if let Err(e) = self.inner.store.rollback_to(version) {
            if let Err(undo) = workspace.undo(&reverted).await {
                warn!(error = %undo, "Could not restore workspace after a refused rollback");
            }
            return Err(e.into());
        }
        workspace.settle_revert(version, head);
        info!(version, files = reverted.len(), "Rolled back graph and workspace");
        Ok(())
    }

    /// Discard a candidate's futures without touching `current_code`.
    #[instrument(skip(self), fields(candidate = %id))]
    pub async fn rollback(&self, id: CandidateId) -> Result<(), GateError> {
        let (submission, confidence) = {
            let mut candidates = self.inner.candidates.write();
            let slot = candidates.get_mut(&id).ok_or(GateError::UnknownCandidate(id))?;
            let from = slot.record.state;
            if !from.can_transition_to(GateState::RolledBack) || slot.committing {
                return Err(GateError::InvalidTransition {
                    candidate: id,
                    from,
                    to: GateState::RolledBack,
                });
            }
            slot.record.set_state(GateState::RolledBack);
            slot.state_tx.send_replace(GateState::RolledBack);
            slot.cancel.cancel();
            (slot.record.submission.clone(), slot.record.confidence().unwrap_or(0.0))
        };

        let cleared = self.inner.store.clear_future(id);
        let events = self.record_outcomes(id, &submission.patterns_used, false, confidence);
        info!(rows = cleared.len(), "Candidate rolled back");

        self.persist(&events).await;
        Ok(())
    }

    /// Cancel in-flight validation (ends in Failed) or a pending approval
    /// (ends in RolledBack). Returns the state at the time of the call.
    #[instrument(skip(self), fields(candidate = %id))]
    pub async fn cancel(&self, id: CandidateId) -> Result<GateState, GateError> {
        let (state, token) = self
            .with_slot(id, |slot| (slot.record.state, slot.cancel.clone()))
            .ok_or(GateError::UnknownCandidate(id))?;
        match state {
            GateState::AwaitingApproval => {
                self.rollback(id).await?;
                Ok(state)
            }
            s if s == GateState::Proposed || s.is_validating() => {
                token.cancel();
                Ok(state)
            }
            other => Err(GateError::InvalidTransition {
                candidate: id,
                from: other,
                to: GateState::Failed,
            }),
        }
    }

    fn record_outcomes(&self, id: CandidateId, patterns: &[String], accepted: bool, confidence: f32) -> Vec<OutcomeEvent> {
        let unique: BTreeSet<&String> = patterns.iter().collect();
        unique
            .into_iter()
            .filter_map(|pattern| {
                match self
                    .inner
                    .patterns
                    .record_outcome_for(pattern, accepted, confidence, Some(id))
                {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(%pattern, error = %e, "Could not record pattern outcome");
                        None
                    }
                }
            })
            .collect()
    }

    /// Write the graph and pattern state through to the database, if any.
    async fn persist(&self, events: &[OutcomeEvent]) {
        let Some(db) = &self.inner.db else {
            return;
        };
        if let Err(e) = db.save_snapshot(&self.inner.store.snapshot()).await {
            warn!(error = %e, "Failed to persist graph snapshot");
        }
        for event in events {
            if let Err(e) = db.append_outcome(event).await {
                warn!(error = %e, "Failed to persist pattern outcome");
            }
        }
        if !events.is_empty() {
            if let Err(e) = db.save_pattern_stats(&self.inner.patterns.all_stats()).await {
                warn!(error = %e, "Failed to persist pattern stats");
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn record(&self, id: CandidateId) -> Result<CandidateRecord, GateError> {
        self.with_slot(id, |slot| slot.record.clone())
            .ok_or(GateError::UnknownCandidate(id))
    }

    pub fn state(&self, id: CandidateId) -> Result<GateState, GateError> {
        self.with_slot(id, |slot| slot.record.state)
            .ok_or(GateError::UnknownCandidate(id))
    }

    /// The report, once validation has settled.
    pub fn get_report(&self, id: CandidateId) -> Result<Option<ValidationReport>, GateError> {
        self.with_slot(id, |slot| slot.record.report.clone())
            .ok_or(GateError::UnknownCandidate(id))
    }

    /// State updates for one candidate.
    pub fn subscribe(&self, id: CandidateId) -> Result<watch::Receiver<GateState>, GateError> {
        self.with_slot(id, |slot| slot.state_tx.subscribe())
            .ok_or(GateError::UnknownCandidate(id))
    }

    /// Wait until validation has settled (AwaitingApproval, Failed or terminal).
    pub async fn wait_settled(&self, id: CandidateId) -> Result<GateState, GateError> {
        let mut rx = self.subscribe(id)?;
        let state = *rx
            .wait_for(GateState::is_settled)
            .await
            .map_err(|_| GateError::UnknownCandidate(id))?;
        Ok(state)
    }

    /// All candidates, oldest first.
    pub fn list(&self) -> Vec<CandidateRecord> {
        let mut records: Vec<CandidateRecord> = self
            .inner
            .candidates
            .read()
            .values()
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    fn with_slot<T>(&self, id: CandidateId, f: impl FnOnce(&Slot) -> T) -> Option<T> {
        self.inner.candidates.read().get(&id).map(f)
    }

    fn with_slot_mut<T>(&self, id: CandidateId, f: impl FnOnce(&mut Slot) -> T) -> Option<T> {
        self.inner.candidates.write().get_mut(&id).map(f)
    }

    fn transition(&self, id: CandidateId, to: GateState) -> Result<GateState, GateError> {
        let mut candidates = self.inner.candidates.write();
        let slot = candidates.get_mut(&id).ok_or(GateError::UnknownCandidate(id))?;
        let from = slot.record.state;
        if !from.can_transition_to(to) {
            return Err(GateError::InvalidTransition { candidate: id, from, to });
        }
        slot.record.set_state(to);
        slot.state_tx.send_replace(to);
        debug!(candidate = %id, %from, %to, "Gate transition");
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PatternConfig, RetrievalConfig, ValidatorConfig};
    use crate::embedder::HashEmbedder;
    use crate::graph::{Edge, EdgeKind, IngestNode, InterfaceNode, NodeKind, StoreError};
    use crate::validator::{
        BuildOutcome, BuildRunner, DiagnosticsChecker, Overlay, RawDiagnostic, TestOutcome, TestRunner,
        TestTarget, ValidationError,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Tools that fail the build for any code containing `BROKEN` and
    /// stall for any code containing `SLOW`.
    struct ScriptedTools;

    fn overlay_text(overlay: &Overlay) -> String {
        overlay
            .detached()
            .iter()
            .map(|(_, code)| code.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[async_trait]
    impl DiagnosticsChecker for ScriptedTools {
        async fn diagnostics(&self, overlay: &Overlay) -> Result<Vec<RawDiagnostic>, ValidationError> {
            if overlay_text(overlay).contains("SLOW") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl BuildRunner for ScriptedTools {
        async fn build(&self, overlay: &Overlay) -> Result<BuildOutcome, ValidationError> {
            let broken = overlay_text(overlay).contains("BROKEN");
            Ok(BuildOutcome {
                success: !broken,
                diagnostics: if broken {
                    vec![RawDiagnostic::error("expected expression").with_code("E0425")]
                } else {
                    Vec::new()
                },
            })
        }
    }

    #[async_trait]
    impl TestRunner for ScriptedTools {
        async fn run_tests(&self, _overlay: &Overlay, _tests: &[TestTarget]) -> Result<TestOutcome, ValidationError> {
            Ok(TestOutcome {
                passed: true,
                failures: Vec::new(),
            })
        }
    }

    async fn gate() -> (SafetyGate, Arc<GraphStore>, Arc<PatternLibrary>) {
        let store = GraphStore::new();
        store
            .upsert_nodes(
                vec![
                    IngestNode::new(InterfaceNode::new("lib::a", NodeKind::Function, "fn a()"), "fn a() { b() }"),
                    IngestNode::new(InterfaceNode::new("lib::b", NodeKind::Function, "fn b()"), "fn b() { c() }"),
                    IngestNode::new(InterfaceNode::new("lib::c", NodeKind::Function, "fn c()"), "fn c() {}"),
                ],
                vec![
                    Edge::new("lib::a", "lib::b", EdgeKind::Calls),
                    Edge::new("lib::b", "lib::c", EdgeKind::Calls),
                ],
            )
            .unwrap();
        let store = Arc::new(store);
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let patterns = Arc::new(
            PatternLibrary::from_config(&PatternConfig::default(), embedder.as_ref())
                .await
                .unwrap(),
        );
        let retriever = Arc::new(HybridRetriever::new(
            store.clone(),
            patterns.clone(),
            embedder.clone(),
            RetrievalConfig::default(),
        ));
        let tools = Arc::new(ScriptedTools);
        let config = ValidatorConfig {
            diagnostics_timeout_ms: 200,
            ..ValidatorConfig::default()
        };
        let validator = Arc::new(Validator::with_tools(
            store.clone(),
            tools.clone(),
            tools.clone(),
            tools,
            config,
            30,
        ));
        let gate = SafetyGate::new(
            store.clone(),
            patterns.clone(),
            embedder,
            retriever,
            validator,
            None,
            &GateConfig::default(),
        );
        (gate, store, patterns)
    }

    fn current(store: &GraphStore, key: &str) -> String {
        store.get_row(&NodeKey::from(key)).unwrap().current_code
    }

    #[tokio::test]
    async fn test_commit_after_approval_only() {
        let (gate, store, patterns) = gate().await;
        let submission = CandidateSubmission::edit("lib::b", "fn b() { c(); c() }")
            .with_patterns(["ownership-clone-before-move"]);

        let id = gate.submit(submission).await.unwrap();
        assert_eq!(gate.wait_settled(id).await.unwrap(), GateState::AwaitingApproval);
        // Nothing written before approval.
        assert_eq!(current(&store, "lib::b"), "fn b() { c() }");

        let report = gate.get_report(id).unwrap().unwrap();
        assert!(report.passed);
        let confidence = report.confidence.unwrap();
        assert!((0.0..=1.0).contains(&confidence));
        assert_eq!(report.confidence_inputs.unwrap().static_precheck, 1.0);

        let version = gate.approve(id).await.unwrap();
        assert_eq!(store.head(), version.number);
        assert_eq!(current(&store, "lib::b"), "fn b() { c(); c() }");
        assert_eq!(gate.state(id).unwrap(), GateState::Committed);

        let stats = patterns.stats("ownership-clone-before-move").unwrap();
        assert_eq!((stats.times_suggested, stats.times_accepted), (1, 1));

        let states: Vec<GateState> = gate.record(id).unwrap().history.iter().map(|c| c.state).collect();
        assert_eq!(
            states,
            vec![
                GateState::Proposed,
                GateState::Validating,
                GateState::DiagnosticsOk,
                GateState::BuildOk,
                GateState::TestsOk,
                GateState::AwaitingApproval,
                GateState::Committed,
            ]
        );
    }

    #[tokio::test]
    async fn test_build_failure_lands_in_failed_and_rolls_back() {
        let (gate, store, patterns) = gate().await;
        let submission = CandidateSubmission::edit("lib::b", "fn b() { BROKEN }").with_patterns(["error-map-err"]);
        let (id, report) = gate.validate(submission).await.unwrap();

        assert!(!report.passed);
        assert_eq!(report.failed_phase(), Some(Phase::Build));
        assert_eq!(gate.state(id).unwrap(), GateState::Failed);
        let row = store.get_row(&NodeKey::from("lib::b")).unwrap();
        assert_eq!(row.validation_status, ValidationStatus::Failed);

        let err = gate.approve(id).await.unwrap_err();
        assert!(matches!(err, GateError::InvalidTransition { .. }));

        gate.rollback(id).await.unwrap();
        assert_eq!(gate.state(id).unwrap(), GateState::RolledBack);
        let row = store.get_row(&NodeKey::from("lib::b")).unwrap();
        assert_eq!(row.current_code, "fn b() { c() }");
        assert!(row.future_code.is_none());

        let stats = patterns.stats("error-map-err").unwrap();
        assert_eq!((stats.times_suggested, stats.times_accepted), (1, 0));
    }

    #[tokio::test]
    async fn test_second_commit_on_same_row_conflicts() {
        let (gate, store, _) = gate().await;
        let (first, _) = gate
            .validate(CandidateSubmission::edit("lib::b", "fn b() { 1 }"))
            .await
            .unwrap();
        let (second, _) = gate
            .validate(CandidateSubmission::edit("lib::b", "fn b() { 2 }"))
            .await
            .unwrap();

        gate.approve(first).await.unwrap();
        let err = gate.approve(second).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert_eq!(current(&store, "lib::b"), "fn b() { 1 }");
        // The loser can still be rolled back.
        assert_eq!(gate.state(second).unwrap(), GateState::AwaitingApproval);
        gate.rollback(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_pattern_and_bad_submission_are_rejected() {
        let (gate, store, _) = gate().await;
        let err = gate
            .submit(CandidateSubmission::edit("lib::b", "fn b() {}").with_patterns(["no-such-pattern"]))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Pattern(PatternError::UnknownPattern(_))));

        let err = gate
            .submit(CandidateSubmission::edit("lib::missing", "fn m() {}"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Store(StoreError::MissingRow(_))));
        assert!(gate.list().is_empty());
        assert!(!store.has_staged());
    }

    #[tokio::test]
    async fn test_cancel_validation_and_pending_approval() {
        let (gate, store, _) = gate().await;
        let slow = gate.submit(CandidateSubmission::edit("lib::a", "fn a() { SLOW }")).await.unwrap();
        gate.cancel(slow).await.unwrap();
        assert_eq!(gate.wait_settled(slow).await.unwrap(), GateState::Failed);
        assert_eq!(
            gate.get_report(slow).unwrap().unwrap().tool_error(),
            Some("Validation cancelled")
        );

        let (waiting, _) = gate
            .validate(CandidateSubmission::edit("lib::c", "fn c() { 3 }"))
            .await
            .unwrap();
        assert_eq!(gate.cancel(waiting).await.unwrap(), GateState::AwaitingApproval);
        assert_eq!(gate.state(waiting).unwrap(), GateState::RolledBack);
        assert_eq!(current(&store, "lib::c"), "fn c() {}");
        assert!(gate.cancel(waiting).await.is_err());
    }

    #[tokio::test]
    async fn test_refine_replaces_failed_candidate() {
        let (gate, _, _) = gate().await;
        let (failed, _) = gate
            .validate(CandidateSubmission::edit("lib::b", "BROKEN"))
            .await
            .unwrap();
        let next = gate
            .refine(failed, CandidateSubmission::edit("lib::b", "fn b() { c() ; }"))
            .await
            .unwrap();

        assert_eq!(gate.state(failed).unwrap(), GateState::RolledBack);
        assert_eq!(gate.wait_settled(next).await.unwrap(), GateState::AwaitingApproval);
        assert_eq!(gate.record(next).unwrap().submission.refines, Some(failed));
    }

    #[tokio::test]
    async fn test_agreement_within_group() {
        let (gate, _, _) = gate().await;
        let same = "fn a() { b(); }";
        gate.validate(CandidateSubmission::edit("lib::a", same).in_group("g")).await.unwrap();
        gate.validate(CandidateSubmission::edit("lib::a", "fn a() {}").in_group("g"))
            .await
            .unwrap();
        let (_, report) = gate
            .validate(CandidateSubmission::edit("lib::a", same).in_group("g"))
            .await
            .unwrap();
        let agreement = report.confidence_inputs.unwrap().agreement;
        assert!((agreement - 2.0 / 3.0).abs() < 1e-6, "{agreement}");
    }

    #[tokio::test]
    async fn test_coverage_uses_context_keys() {
        let (gate, _, _) = gate().await;
        let (_, report) = gate
            .validate(CandidateSubmission::edit("lib::b", "fn b() {}").with_context(vec!["lib::a".into()]))
            .await
            .unwrap();
        // Blast radius of b is {a, c}; only a was in context.
        assert_eq!(report.confidence_inputs.unwrap().coverage, 0.5);
    }
}
