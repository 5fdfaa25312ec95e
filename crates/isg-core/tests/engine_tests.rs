mod common;

use std::sync::Arc;

use common::{chain, engine, engine_in, engine_with, function, FakeTools};
use isg_core::gate::{CandidateSubmission, Decision};
use isg_core::graph::{GraphDb, IngestBatch, Level, NodeKey};
use isg_core::{EngineError, QueryRequest};
use tempfile::TempDir;

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let engine = engine().await;
    let first = engine.ingest(chain()).await.unwrap();
    assert_eq!(first.nodes_added, 3);
    assert_eq!(first.edges_added, 2);
    let version = first.version.unwrap().number;

    let again = engine.ingest(chain()).await.unwrap();
    assert!(again.is_unchanged());
    assert_eq!(again.nodes_added + again.nodes_updated + again.edges_added, 0);
    assert_eq!(engine.stats().head, version);
    assert_eq!(engine.versions().len(), 1);

    let node = engine.store().get_node(&NodeKey::from("src/lib.rs::b")).unwrap();
    assert!(node.embedding.is_some());
}

#[tokio::test]
async fn test_changed_body_updates_row() {
    let engine = engine().await;
    engine.ingest(chain()).await.unwrap();

    let mut batch = chain();
    batch.nodes[2] = function("src/lib.rs::c", "fn c() { 42 }");
    let outcome = engine.ingest(batch).await.unwrap();
    assert_eq!(outcome.nodes_updated, 1);
    assert_eq!(
        engine.store().get_row(&NodeKey::from("src/lib.rs::c")).unwrap().current_code,
        "fn c() { 42 }"
    );
}

#[tokio::test]
async fn test_query_returns_seed_neighbourhood() {
    let engine = engine().await;
    engine.ingest(chain()).await.unwrap();

    let shortlist = engine
        .query(QueryRequest {
            seed_keys: vec![NodeKey::from("src/lib.rs::b")],
            hints: Vec::new(),
            token_budget: None,
        })
        .await
        .unwrap();

    let keys = shortlist.keys();
    assert_eq!(keys.len(), 3);
    assert_eq!(keys[0], NodeKey::from("src/lib.rs::b"));
    assert!(shortlist.items.iter().all(|i| i.level == Level::L1));
    assert!(!shortlist.truncated);
}

#[tokio::test]
async fn test_query_rejects_non_positive_budget() {
    let engine = engine().await;
    let err = engine
        .query(QueryRequest {
            seed_keys: vec![NodeKey::from("src/lib.rs::b")],
            hints: Vec::new(),
            token_budget: Some(0),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn test_rollback_to_earlier_version() {
    let engine = engine().await;
    engine.ingest(chain()).await.unwrap();
    let base = engine.stats().head;

    let (id, _) = engine
        .check(CandidateSubmission::edit("src/lib.rs::a", "fn a() { b(); b() }"))
        .await
        .unwrap();
    engine.decide(id, Decision::Approve).await.unwrap();
    assert_eq!(engine.stats().head, base + 1);

    engine.rollback_to(base).await.unwrap();
    assert_eq!(engine.stats().head, base);
    assert_eq!(
        engine.store().get_row(&NodeKey::from("src/lib.rs::a")).unwrap().current_code,
        "fn a() { b() }"
    );
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let db = Arc::new(GraphDb::in_memory().await.unwrap());

    let engine = engine_with(Some(db.clone()), Arc::new(FakeTools::default())).await;
    engine.ingest(chain()).await.unwrap();
    let (id, _) = engine
        .check(CandidateSubmission::edit("src/lib.rs::c", "fn c() { 1 }").with_patterns(["error-map-err"]))
        .await
        .unwrap();
    engine.decide(id, Decision::Approve).await.unwrap();
    // Left staged at shutdown.
    engine
        .submit(CandidateSubmission::edit("src/lib.rs::a", "fn a() {}"))
        .await
        .unwrap();
    let head = engine.stats().head;
    engine.persist().await.unwrap();
    drop(engine);

    let reopened = engine_with(Some(db), Arc::new(FakeTools::default())).await;
    assert_eq!(reopened.stats().head, head);
    assert_eq!(reopened.stats().nodes, 3);
    assert_eq!(
        reopened.store().get_row(&NodeKey::from("src/lib.rs::c")).unwrap().current_code,
        "fn c() { 1 }"
    );
    assert!(!reopened.store().has_staged());

    let stats = reopened.patterns().stats("error-map-err").unwrap();
    assert_eq!(stats.times_accepted, 1);
    assert_eq!(reopened.patterns().outcome_history("error-map-err").len(), 1);
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("graph.json");

    let source = engine().await;
    source.ingest(chain()).await.unwrap();
    let (id, _) = source
        .check(CandidateSubmission::edit("src/lib.rs::b", "fn b() {}"))
        .await
        .unwrap();
    source.decide(id, Decision::Approve).await.unwrap();
    let exported = source.export(&path).unwrap();

    let mut target = engine().await;
    let imported = target.import(&path).await.unwrap();
    assert_eq!(imported.head, exported.head);
    assert_eq!(imported.nodes, exported.nodes);
    assert_eq!(imported.edges, exported.edges);
    assert_eq!(target.snapshot(), source.snapshot());

    // The rebuilt gate works against the imported graph.
    let (next, report) = target
        .check(CandidateSubmission::edit("src/lib.rs::c", "fn c() { 7 }"))
        .await
        .unwrap();
    assert!(report.passed);
    target.decide(next, Decision::Approve).await.unwrap();
    assert_eq!(target.stats().head, exported.head + 1);
}

#[tokio::test]
async fn test_import_refused_while_staged() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("graph.json");

    let mut engine = engine().await;
    engine.ingest(chain()).await.unwrap();
    engine.export(&path).unwrap();
    let (_, report) = engine
        .check(CandidateSubmission::edit("src/lib.rs::b", "fn b() { 3 }"))
        .await
        .unwrap();
    assert!(report.passed);

    let err = engine.import(&path).await.unwrap_err();
    assert!(matches!(&err, EngineError::Store(e) if e.is_conflict()), "{err}");
}

#[tokio::test]
async fn test_import_rejects_garbage() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("graph.json");
    std::fs::write(&path, "{ not json").unwrap();

    let mut engine = engine().await;
    assert!(matches!(engine.import(&path).await, Err(EngineError::Snapshot(_))));
    assert!(matches!(
        engine.import(&temp.path().join("missing.json")).await,
        Err(EngineError::Io { .. })
    ));
}

#[tokio::test]
async fn test_index_directory() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("lib.rs"),
        "/// Parse input.\npub fn parse(input: &str) -> usize {\n    helper(input)\n}\n\nfn helper(input: &str) -> usize {\n    input.len()\n}\n",
    )
    .unwrap();

    let engine = engine().await;
    let report = engine.index_directory(temp.path()).await.unwrap();
    assert_eq!(report.files, 1);
    assert!(report.skipped.is_empty());
    assert!(report.nodes >= 2);
    assert!(engine.stats().nodes >= 2);

    let again = engine.index_directory(temp.path()).await.unwrap();
    assert!(again.outcome.is_unchanged());
}

#[tokio::test]
async fn test_ingest_rejects_dangling_edges_whole_batch() {
    let engine = engine().await;
    let mut batch = chain();
    batch.edges.push(isg_core::graph::Edge::new(
        "src/lib.rs::a",
        "src/lib.rs::ghost",
        isg_core::graph::EdgeKind::Calls,
    ));
    let err = engine.ingest(batch).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(engine.stats().nodes, 0);

    let empty = engine.ingest(IngestBatch::default()).await.unwrap();
    assert!(empty.is_unchanged());
}

const LIB: &str = "pub fn a() -> u32 {\n    1\n}\n\npub fn b() -> u32 {\n    a()\n}\n";

fn lib_rs(temp: &TempDir) -> String {
    std::fs::read_to_string(temp.path().join("src/lib.rs")).unwrap()
}

#[tokio::test]
async fn test_approved_edits_are_written_to_indexed_files() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("src")).unwrap();
    std::fs::write(temp.path().join("src/lib.rs"), LIB).unwrap();

    let engine = engine_in(temp.path(), Arc::new(FakeTools::default())).await;
    engine.index_directory(temp.path()).await.unwrap();
    let base = engine.stats().head;

    // `a` grows by a line, pushing `b` down.
    let (id, report) = engine
        .check(CandidateSubmission::edit(
            "src/lib.rs::a",
            "pub fn a() -> u32 {\n    let x = 2;\n    x\n}",
        ))
        .await
        .unwrap();
    assert!(report.passed);
    engine.decide(id, Decision::Approve).await.unwrap();
    assert_eq!(
        lib_rs(&temp),
        "pub fn a() -> u32 {\n    let x = 2;\n    x\n}\n\npub fn b() -> u32 {\n    a()\n}\n"
    );
    let b = engine.store().get_node(&NodeKey::from("src/lib.rs::b")).unwrap();
    assert_eq!(b.span.map(|s| (s.start_line, s.end_line)), Some((6, 8)));

    // Both nodes still line up with the file.
    let (id, report) = engine
        .check(CandidateSubmission::edit("src/lib.rs::b", "pub fn b() -> u32 {\n    a() + 1\n}"))
        .await
        .unwrap();
    assert!(report.passed);
    engine.decide(id, Decision::Approve).await.unwrap();
    let (id, report) = engine
        .check(CandidateSubmission::edit("src/lib.rs::a", "pub fn a() -> u32 {\n    3\n}"))
        .await
        .unwrap();
    assert!(report.passed);
    engine.decide(id, Decision::Approve).await.unwrap();
    assert_eq!(
        lib_rs(&temp),
        "pub fn a() -> u32 {\n    3\n}\n\npub fn b() -> u32 {\n    a() + 1\n}\n"
    );
    assert_eq!(engine.stats().head, base + 3);

    let again = engine.index_directory(temp.path()).await.unwrap();
    assert!(again.outcome.is_unchanged());

    // A failing spanned edit leaves the file alone.
    let (id, report) = engine
        .check(CandidateSubmission::edit("src/lib.rs::a", "pub fn a() -> u32 {\n    BROKEN\n}"))
        .await
        .unwrap();
    assert!(!report.passed);
    engine.decide(id, Decision::Reject).await.unwrap();
    assert!(lib_rs(&temp).contains("    3\n"));

    engine.rollback_to(base).await.unwrap();
    assert_eq!(lib_rs(&temp), LIB);
    assert_eq!(
        engine.store().get_row(&NodeKey::from("src/lib.rs::a")).unwrap().current_code,
        "pub fn a() -> u32 {\n    1\n}"
    );
    // The reverted versions cannot be restored over the files.
    assert!(matches!(engine.rollback_to(base + 2).await, Err(EngineError::Gate(_))));
    assert_eq!(lib_rs(&temp), LIB);
}

#[tokio::test]
async fn test_rollback_refuses_files_edited_outside_the_gate() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("src")).unwrap();
    std::fs::write(temp.path().join("src/lib.rs"), LIB).unwrap();

    let engine = engine_in(temp.path(), Arc::new(FakeTools::default())).await;
    engine.index_directory(temp.path()).await.unwrap();
    let base = engine.stats().head;

    let (id, _) = engine
        .check(CandidateSubmission::edit("src/lib.rs::a", "pub fn a() -> u32 {\n    2\n}"))
        .await
        .unwrap();
    engine.decide(id, Decision::Approve).await.unwrap();

    std::fs::write(temp.path().join("src/lib.rs"), "pub fn a() -> u32 { 9 }\n").unwrap();
    assert!(matches!(engine.rollback_to(base).await, Err(EngineError::Gate(_))));
    assert_eq!(engine.stats().head, base + 1);
    assert_eq!(lib_rs(&temp), "pub fn a() -> u32 { 9 }\n");
}
