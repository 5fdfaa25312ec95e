#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use isg_core::graph::{Edge, EdgeKind, GraphDb, IngestBatch, IngestNode, InterfaceNode, NodeKind, Tag};
use isg_core::validator::{
    BuildOutcome, BuildRunner, DiagnosticsChecker, Overlay, RawDiagnostic, TestOutcome, TestRunner, TestTarget,
    ValidationError,
};
use isg_core::{Config, ContextEngine, HashEmbedder};

/// Validator tools that never spawn cargo.
///
/// Code containing `BROKEN` fails the build; code containing `WARN` yields
/// a warning diagnostic. Test runs are recorded by name.
#[derive(Default)]
pub struct FakeTools {
    pub ran: Mutex<Vec<String>>,
}

/// Candidate text the fake tools look at: detached futures plus every
/// rewritten file.
fn overlay_text(overlay: &Overlay) -> String {
    overlay
        .detached()
        .iter()
        .map(|(_, code)| code.as_str())
        .chain(overlay.files().map(|(_, content)| content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl DiagnosticsChecker for FakeTools {
    async fn diagnostics(&self, overlay: &Overlay) -> Result<Vec<RawDiagnostic>, ValidationError> {
        if overlay_text(overlay).contains("WARN") {
            return Ok(vec![RawDiagnostic::warning("unused variable")]);
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl BuildRunner for FakeTools {
    async fn build(&self, overlay: &Overlay) -> Result<BuildOutcome, ValidationError> {
        let broken = overlay_text(overlay).contains("BROKEN");
        Ok(BuildOutcome {
            success: !broken,
            diagnostics: if broken {
                vec![RawDiagnostic::error("mismatched types").with_code("E0308")]
            } else {
                Vec::new()
            },
        })
    }
}

#[async_trait]
impl TestRunner for FakeTools {
    async fn run_tests(&self, _overlay: &Overlay, tests: &[TestTarget]) -> Result<TestOutcome, ValidationError> {
        self.ran.lock().extend(tests.iter().map(|t| t.name.clone()));
        Ok(TestOutcome {
            passed: true,
            failures: Vec::new(),
        })
    }
}

/// Approved candidates are written under a fresh directory per call.
pub fn test_config() -> Config {
    config_in(&std::env::temp_dir().join(format!("isg-engine-tests-{}", uuid::Uuid::new_v4())))
}

pub fn config_in(root: &Path) -> Config {
    let mut config = Config::default();
    config.store.persist = false;
    config.validator.workspace_root = root.to_path_buf();
    config.validator.diagnostics_timeout_ms = 500;
    config
}

/// Engine with fake tools and a hash embedder, optionally backed by `db`.
pub async fn engine_with(db: Option<Arc<GraphDb>>, tools: Arc<FakeTools>) -> ContextEngine {
    build(test_config(), db, tools).await
}

/// Engine whose workspace is `root`.
pub async fn engine_in(root: &Path, tools: Arc<FakeTools>) -> ContextEngine {
    build(config_in(root), None, tools).await
}

async fn build(config: Config, db: Option<Arc<GraphDb>>, tools: Arc<FakeTools>) -> ContextEngine {
    let mut builder = ContextEngine::builder(config)
        .embedder(Arc::new(HashEmbedder::new(64)))
        .tools(tools.clone(), tools.clone(), tools);
    if let Some(db) = db {
        builder = builder.database(db);
    }
    builder.build().await.unwrap()
}

pub async fn engine() -> ContextEngine {
    engine_with(None, Arc::new(FakeTools::default())).await
}

pub fn function(key: &str, code: &str) -> IngestNode {
    let name = key.rsplit("::").next().unwrap_or(key);
    IngestNode::new(
        InterfaceNode::new(key, NodeKind::Function, format!("fn {name}()")),
        code,
    )
}

pub fn test_function(key: &str, code: &str) -> IngestNode {
    let mut node = function(key, code);
    node.node = node.node.with_tag(Tag::Test);
    node
}

/// `a` calls `b` calls `c`.
pub fn chain() -> IngestBatch {
    IngestBatch {
        nodes: vec![
            function("src/lib.rs::a", "fn a() { b() }"),
            function("src/lib.rs::b", "fn b() { c() }"),
            function("src/lib.rs::c", "fn c() {}"),
        ],
        edges: vec![
            Edge::new("src/lib.rs::a", "src/lib.rs::b", EdgeKind::Calls),
            Edge::new("src/lib.rs::b", "src/lib.rs::c", EdgeKind::Calls),
        ],
    }
}
