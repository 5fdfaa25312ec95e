mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{chain, engine, engine_with, function, test_function, FakeTools};
use isg_core::gate::{CandidateSubmission, Decision, GateState};
use isg_core::graph::{Edge, EdgeKind, IngestBatch, NodeKey, ValidationStatus};
use isg_core::patterns::PatternStats;
use isg_core::validator::Phase;
use isg_core::EngineError;

fn key(s: &str) -> NodeKey {
    NodeKey::from(s)
}

fn current(engine: &isg_core::ContextEngine, k: &str) -> String {
    engine.store().get_row(&key(k)).unwrap().current_code
}

#[tokio::test]
async fn test_editing_middle_of_chain_selects_dependent_tests() {
    let tools = Arc::new(FakeTools::default());
    let engine = engine_with(None, tools.clone()).await;
    engine.ingest(chain()).await.unwrap();

    let radius: BTreeSet<NodeKey> = engine
        .store()
        .blast_radius(&[key("src/lib.rs::b")], 30)
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(radius, BTreeSet::from([key("src/lib.rs::a"), key("src/lib.rs::c")]));

    // t_b calls b directly, t_a reaches b through a, t_c never reaches b.
    engine
        .ingest(IngestBatch {
            nodes: vec![
                test_function("src/lib.rs::tests::t_a", "fn t_a() { a() }"),
                test_function("src/lib.rs::tests::t_b", "fn t_b() { b() }"),
                test_function("src/lib.rs::tests::t_c", "fn t_c() { c() }"),
            ],
            edges: vec![
                Edge::new("src/lib.rs::tests::t_a", "src/lib.rs::a", EdgeKind::Calls),
                Edge::new("src/lib.rs::tests::t_b", "src/lib.rs::b", EdgeKind::Calls),
                Edge::new("src/lib.rs::tests::t_c", "src/lib.rs::c", EdgeKind::Calls),
            ],
        })
        .await
        .unwrap();

    let (_, report) = engine
        .check(CandidateSubmission::edit("src/lib.rs::b", "fn b() { c(); c() }"))
        .await
        .unwrap();

    assert!(report.passed, "{}", report.summary());
    let selected: BTreeSet<NodeKey> = report.tests.iter().cloned().collect();
    assert_eq!(
        selected,
        BTreeSet::from([key("src/lib.rs::tests::t_a"), key("src/lib.rs::tests::t_b")])
    );
    let mut ran = tools.ran.lock().clone();
    ran.sort();
    assert_eq!(ran, vec!["tests::t_a".to_string(), "tests::t_b".to_string()]);
}

#[tokio::test]
async fn test_second_commit_on_same_row_is_a_conflict() {
    let engine = engine().await;
    engine.ingest(chain()).await.unwrap();

    let first = engine
        .submit(CandidateSubmission::edit("src/lib.rs::b", "fn b() { 1 }"))
        .await
        .unwrap();
    let second = engine
        .submit(CandidateSubmission::edit("src/lib.rs::b", "fn b() { 2 }"))
        .await
        .unwrap();
    assert_eq!(engine.wait_settled(first).await.unwrap(), GateState::AwaitingApproval);
    assert_eq!(engine.wait_settled(second).await.unwrap(), GateState::AwaitingApproval);

    let record = engine.decide(first, Decision::Approve).await.unwrap();
    assert_eq!(record.state, GateState::Committed);

    let err = engine.decide(second, Decision::Approve).await.unwrap_err();
    assert!(matches!(&err, EngineError::Gate(g) if g.is_conflict()), "{err}");
    assert_eq!(current(&engine, "src/lib.rs::b"), "fn b() { 1 }");
}

#[tokio::test]
async fn test_build_failure_after_clean_diagnostics_fails_in_build() {
    let engine = engine().await;
    engine.ingest(chain()).await.unwrap();

    let (id, report) = engine
        .check(CandidateSubmission::edit("src/lib.rs::b", "fn b() -> u32 { BROKEN }"))
        .await
        .unwrap();

    assert!(!report.passed);
    assert_eq!(report.diagnostics_in(Phase::Diagnostics), 0);
    assert_eq!(report.failed_phase(), Some(Phase::Build));
    assert_eq!(report.phase_reached.as_str(), "build");
    assert_eq!(report.status, ValidationStatus::Failed);
    assert_eq!(engine.gate().state(id).unwrap(), GateState::Failed);

    let row = engine.store().get_row(&key("src/lib.rs::b")).unwrap();
    assert_eq!(row.validation_status, ValidationStatus::Failed);
    assert_eq!(row.current_code, "fn b() { c() }");
}

#[tokio::test]
async fn test_failed_then_rolled_back_leaves_code_untouched() {
    let engine = engine().await;
    engine.ingest(chain()).await.unwrap();
    let before: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|n| current(&engine, &format!("src/lib.rs::{n}")))
        .collect();
    let head = engine.stats().head;

    let submission = isg_core::gate::CandidateSubmission::new(
        vec![key("src/lib.rs::a"), key("src/lib.rs::b")],
        isg_core::graph::FutureAction::Edit,
        "BROKEN",
    );
    let (id, _) = engine.check(submission).await.unwrap();
    let record = engine.decide(id, Decision::Reject).await.unwrap();
    assert_eq!(record.state, GateState::RolledBack);

    let after: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|n| current(&engine, &format!("src/lib.rs::{n}")))
        .collect();
    assert_eq!(before, after);
    assert_eq!(engine.stats().head, head);
    assert!(!engine.store().has_staged());
}

#[tokio::test]
async fn test_accepted_outcome_updates_pattern_counters() {
    let engine = engine().await;
    let patterns = engine.patterns();
    patterns.restore(
        vec![PatternStats {
            pattern_id: "error-map-err".to_string(),
            times_suggested: 10,
            times_accepted: 9,
            success_rate: 0.9,
            avg_confidence: 0.8,
        }],
        Vec::new(),
    );

    patterns.record_outcome("error-map-err", true, 0.9).unwrap();

    let stats = patterns.stats("error-map-err").unwrap();
    assert_eq!(stats.times_suggested, 11);
    assert_eq!(stats.times_accepted, 10);
    assert!((stats.success_rate - 0.909).abs() < 1e-3, "{}", stats.success_rate);
}

#[tokio::test]
async fn test_commit_through_engine_credits_patterns() {
    let engine = engine().await;
    engine.ingest(chain()).await.unwrap();

    let (id, report) = engine
        .check(CandidateSubmission::edit("src/lib.rs::c", "fn c() { WARN }").with_patterns(["error-map-err"]))
        .await
        .unwrap();
    assert!(report.passed);
    // Warnings are reported but do not fail the phase.
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].node, key("src/lib.rs::c"));

    let record = engine.decide(id, Decision::Approve).await.unwrap();
    let version = record.committed_version.unwrap();
    assert_eq!(engine.stats().head, version);
    assert_eq!(current(&engine, "src/lib.rs::c"), "fn c() { WARN }");

    let stats = engine.patterns().stats("error-map-err").unwrap();
    assert_eq!((stats.times_suggested, stats.times_accepted), (1, 1));
}

#[tokio::test]
async fn test_create_and_delete_rows() {
    let engine = engine().await;
    engine
        .ingest(IngestBatch {
            nodes: vec![function("src/lib.rs::a", "fn a() {}"), function("src/lib.rs::old", "fn old() {}")],
            edges: Vec::new(),
        })
        .await
        .unwrap();

    let create = CandidateSubmission::new(
        vec![key("src/lib.rs::fresh")],
        isg_core::graph::FutureAction::Create,
        "fn fresh() {}",
    );
    let (created, report) = engine.check(create).await.unwrap();
    assert!(report.passed);
    assert!(report.tests_none_run);
    engine.decide(created, Decision::Approve).await.unwrap();
    assert_eq!(current(&engine, "src/lib.rs::fresh"), "fn fresh() {}");

    let delete = CandidateSubmission::new(
        vec![key("src/lib.rs::old")],
        isg_core::graph::FutureAction::Delete,
        "",
    );
    let (deleted, _) = engine.check(delete).await.unwrap();
    engine.decide(deleted, Decision::Approve).await.unwrap();
    assert!(engine.store().get_row(&key("src/lib.rs::old")).is_none());
}
