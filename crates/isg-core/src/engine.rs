//! Context engine facade.
//!
//! Wires the graph store, pattern library, retrieval, validator and safety
//! gate together and owns their persistence.
//!
//! # Example
//!
//! ```ignore
//! use isg_core::{Config, ContextEngine, QueryRequest};
//!
//! let engine = ContextEngine::open(Config::load()?).await?;
//! engine.index_directory(".".as_ref()).await?;
//!
//! let shortlist = engine
//!     .query(QueryRequest {
//!         seed_keys: vec!["src/lib.rs::parse".into()],
//!         hints: vec!["error handling".into()],
//!         token_budget: Some(4000),
//!     })
//!     .await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::embedder::{self, EmbedError, Embedder};
use crate::gate::{CandidateRecord, CandidateSubmission, Decision, GateError, GateState, SafetyGate};
use crate::graph::{
    CandidateId, GraphDb, GraphSnapshot, GraphStore, GraphVersion, IngestBatch, IngestOutcome, StoreError,
    StoreStats,
};
use crate::ingest::{self, IngestError, RustIndexer};
use crate::patterns::{PatternError, PatternLibrary};
use crate::retrieval::{HybridRetriever, QueryRequest, RetrievalError, Shortlist, TokenBudget};
use crate::validator::{BuildRunner, DiagnosticsChecker, TestRunner, ValidationReport, Validator};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Result of indexing a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub files: usize,
    pub skipped: Vec<String>,
    pub nodes: usize,
    pub edges: usize,
    pub outcome: IngestOutcome,
}

#[derive(Clone)]
struct Tools {
    checker: Arc<dyn DiagnosticsChecker>,
    builder: Arc<dyn BuildRunner>,
    tester: Arc<dyn TestRunner>,
}

/// Builder for a [`ContextEngine`] with non-default parts.
pub struct EngineBuilder {
    config: Config,
    embedder: Option<Arc<dyn Embedder>>,
    db: Option<Arc<GraphDb>>,
    tools: Option<Tools>,
}

impl EngineBuilder {
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use this database instead of the one named by the configuration.
    pub fn database(mut self, db: Arc<GraphDb>) -> Self {
        self.db = Some(db);
        self
    }

    /// Replace the cargo toolchain used by the validator.
    pub fn tools(
        mut self,
        checker: Arc<dyn DiagnosticsChecker>,
        builder: Arc<dyn BuildRunner>,
        tester: Arc<dyn TestRunner>,
    ) -> Self {
        self.tools = Some(Tools {
            checker,
            builder,
            tester,
        });
        self
    }

    pub async fn build(self) -> Result<ContextEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => embedder::from_config(&config.embedding)?,
        };

        let db = match self.db {
            Some(db) => Some(db),
            None if config.store.persist => Some(Arc::new(open_db(&config.store.db_path()).await?)),
            None => None,
        };
        if let Some(db) = &db {
            if !db.is_initialized().await? {
                db.initialize_schema().await?;
            }
        }

        let store = match &db {
            Some(db) => match db.load_snapshot().await? {
                Some(snapshot) => GraphStore::from_snapshot(snapshot)?,
                None => GraphStore::new(),
            },
            None => GraphStore::new(),
        };
        let stale = store.discard_all_staged();
        if stale > 0 {
            warn!(futures = stale, "Discarded futures staged before the last shutdown");
        }

        let patterns = PatternLibrary::from_config(&config.patterns, embedder.as_ref()).await?;
        if let Some(db) = &db {
            patterns.restore(db.load_pattern_stats().await?, db.load_outcomes().await?);
        }

        let engine = ContextEngine::assemble(config, Arc::new(store), Arc::new(patterns), embedder, db, self.tools);
        let stats = engine.stats();
        info!(
            head = stats.head,
            nodes = stats.nodes,
            edges = stats.edges,
            patterns = engine.patterns.len(),
            "Context engine ready"
        );
        Ok(engine)
    }
}

async fn open_db(path: &Path) -> Result<GraphDb, EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| EngineError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(GraphDb::open(path).await?)
}

/// The assembled system.
pub struct ContextEngine {
    config: Config,
    store: Arc<GraphStore>,
    patterns: Arc<PatternLibrary>,
    embedder: Arc<dyn Embedder>,
    retriever: Arc<HybridRetriever>,
    gate: SafetyGate,
    db: Option<Arc<GraphDb>>,
    tools: Option<Tools>,
}

impl ContextEngine {
    /// Open with the parts named by `config`.
    pub async fn open(config: Config) -> Result<Self, EngineError> {
        Self::builder(config).build().await
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            embedder: None,
            db: None,
            tools: None,
        }
    }

    fn assemble(
        config: Config,
        store: Arc<GraphStore>,
        patterns: Arc<PatternLibrary>,
        embedder: Arc<dyn Embedder>,
        db: Option<Arc<GraphDb>>,
        tools: Option<Tools>,
    ) -> Self {
        let retriever = Arc::new(HybridRetriever::new(
            Arc::clone(&store),
            Arc::clone(&patterns),
            Arc::clone(&embedder),
            config.retrieval.clone(),
        ));
        let max_per_hop = config.retrieval.max_per_hop;
        let validator = Arc::new(match &tools {
            Some(t) => Validator::with_tools(
                Arc::clone(&store),
                Arc::clone(&t.checker),
                Arc::clone(&t.builder),
                Arc::clone(&t.tester),
                config.validator.clone(),
                max_per_hop,
            ),
            None => Validator::new(Arc::clone(&store), config.validator.clone(), max_per_hop),
        });
        let gate = SafetyGate::new(
            Arc::clone(&store),
            Arc::clone(&patterns),
            Arc::clone(&embedder),
            Arc::clone(&retriever),
            validator,
            db.clone(),
            &config.gate,
        );
        Self {
            config,
            store,
            patterns,
            embedder,
            retriever,
            gate,
            db,
            tools,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn patterns(&self) -> &Arc<PatternLibrary> {
        &self.patterns
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Embed, upsert and persist a batch.
    pub async fn ingest(&self, mut batch: IngestBatch) -> Result<IngestOutcome, EngineError> {
        let embedded = ingest::embed_missing(&mut batch, &self.store, self.embedder.as_ref()).await?;
        let outcome = self.store.upsert_nodes(batch.nodes, batch.edges)?;
        info!(
            embedded,
            added = outcome.nodes_added,
            updated = outcome.nodes_updated,
            edges = outcome.edges_added,
            version = ?outcome.version,
            "Ingested batch"
        );
        if !outcome.is_unchanged() {
            self.persist().await?;
        }
        Ok(outcome)
    }

    /// Index a Rust workspace and ingest the result.
    pub async fn index_directory(&self, root: &Path) -> Result<IndexReport, EngineError> {
        let root = root.to_path_buf();
        let tree = tokio::task::spawn_blocking(move || RustIndexer::new().index_directory(&root))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;

        for path in &tree.skipped {
            warn!(%path, "Skipped file");
        }
        let nodes = tree.batch.nodes.len();
        let edges = tree.batch.edges.len();
        let outcome = self.ingest(tree.batch).await?;
        Ok(IndexReport {
            files: tree.files,
            skipped: tree.skipped,
            nodes,
            edges,
            outcome,
        })
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    pub async fn query(&self, request: QueryRequest) -> Result<Shortlist, EngineError> {
        let budget = match request.token_budget {
            Some(tokens) => TokenBudget::new(tokens)?,
            None => TokenBudget::new(self.config.retrieval.default_token_budget as i64)?,
        };
        Ok(self
            .retriever
            .retrieve(request.seed_keys, request.hints, budget)
            .await?)
    }

    // ========================================================================
    // Candidates
    // ========================================================================

    pub async fn submit(&self, submission: CandidateSubmission) -> Result<CandidateId, EngineError> {
        Ok(self.gate.submit(submission).await?)
    }

    /// Submit and wait for the validation report.
    pub async fn check(&self, submission: CandidateSubmission) -> Result<(CandidateId, ValidationReport), EngineError> {
        Ok(self.gate.validate(submission).await?)
    }

    pub fn get_report(&self, id: CandidateId) -> Result<Option<ValidationReport>, EngineError> {
        Ok(self.gate.get_report(id)?)
    }

    pub async fn wait_settled(&self, id: CandidateId) -> Result<GateState, EngineError> {
        Ok(self.gate.wait_settled(id).await?)
    }

    pub async fn decide(&self, id: CandidateId, decision: Decision) -> Result<CandidateRecord, EngineError> {
        Ok(self.gate.decide(id, decision).await?)
    }

    // ========================================================================
    // Versions
    // ========================================================================

    pub fn versions(&self) -> Vec<GraphVersion> {
        self.store.versions()
    }

    /// Move the head back to a retained version, restore the files the
    /// gate wrote since, and persist.
    pub async fn rollback_to(&self, version: u64) -> Result<(), EngineError> {
        self.gate.rollback_to(version).await?;
        info!(version, "Rolled back graph head");
        self.persist().await
    }

    /// Write the store to the database, if one is attached.
    pub async fn persist(&self) -> Result<(), EngineError> {
        if let Some(db) = &self.db {
            db.save_snapshot(&self.store.snapshot()).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn snapshot(&self) -> GraphSnapshot {
        self.store.snapshot()
    }

    /// Write the graph as JSON.
    pub fn export(&self, path: &Path) -> Result<StoreStats, EngineError> {
        let json = serde_json::to_string_pretty(&self.store.snapshot())?;
        std::fs::write(path, json).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.stats())
    }

    /// Replace the graph with a JSON export. Refused while candidates are staged.
    pub async fn import(&mut self, path: &Path) -> Result<StoreStats, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: GraphSnapshot = serde_json::from_str(&content)?;
        self.restore(snapshot).await
    }

    pub async fn restore(&mut self, snapshot: GraphSnapshot) -> Result<StoreStats, EngineError> {
        if self.store.has_staged() {
            let keys = self.store.snapshot().staged.into_iter().map(|f| f.key);
            return Err(StoreError::conflict(keys).into());
        }
        let store = GraphStore::from_snapshot(snapshot)?;
        store.discard_all_staged();

        let rebuilt = Self::assemble(
            self.config.clone(),
            Arc::new(store),
            Arc::clone(&self.patterns),
            Arc::clone(&self.embedder),
            self.db.clone(),
            self.tools.clone(),
        );
        *self = rebuilt;
        self.persist().await?;
        Ok(self.stats())
    }
}
