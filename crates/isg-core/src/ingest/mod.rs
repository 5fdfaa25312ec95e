//! Ingest of interface nodes into the graph.
//!
//! Two producers feed [`GraphStore::upsert_nodes`](crate::graph::GraphStore::upsert_nodes):
//!
//! - batch JSON files (`{ "nodes": [...], "edges": [...] }`) written by any
//!   external indexer
//! - [`RustIndexer`], which walks a cargo workspace and extracts nodes and
//!   edges from Rust sources with `syn`

mod rust;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::embedder::{EmbedError, Embedder};
use crate::graph::{GraphStore, IngestBatch, StoreError};

pub use rust::{IndexedTree, RustIndexer};

/// Errors raised while reading or indexing ingest input.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A source file or manifest could not be parsed.
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid ingest batch: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbedError),
}

/// Read a batch JSON file.
pub fn load_batch(path: &Path) -> Result<IngestBatch, IngestError> {
    let content = std::fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_batch(&content)
}

pub fn parse_batch(json: &str) -> Result<IngestBatch, IngestError> {
    Ok(serde_json::from_str(json)?)
}

/// Fill in embeddings for nodes that carry none.
///
/// A node whose summary matches the stored node keeps the stored vector, so
/// re-ingesting unchanged content never re-embeds it. Returns the number of
/// nodes sent to the embedder.
pub async fn embed_missing(
    batch: &mut IngestBatch,
    store: &GraphStore,
    embedder: &dyn Embedder,
) -> Result<usize, IngestError> {
    let mut pending = Vec::new();
    for (i, item) in batch.nodes.iter_mut().enumerate() {
        if item.node.embedding.is_some() {
            continue;
        }
        let summary = item.node.summary();
        match store.get_node(&item.node.key) {
            Some(existing) if existing.embedding.is_some() && existing.summary() == summary => {
                item.node.embedding = existing.embedding;
            }
            _ => pending.push((i, summary)),
        }
    }

    if pending.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = pending.iter().map(|(_, s)| s.clone()).collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(EmbedError::Response(format!(
            "asked for {} embeddings, got {}",
            texts.len(),
            vectors.len()
        ))
        .into());
    }
    for ((i, _), vector) in pending.iter().zip(vectors) {
        batch.nodes[*i].node.embedding = Some(vector);
    }
    Ok(texts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::graph::{EdgeKind, NodeKind};

    const BATCH: &str = r#"{
        "nodes": [
            { "key": "src/lib.rs::a", "kind": "function", "level": "L1", "signature": "fn a()", "code": "fn a() { b() }" },
            { "key": "src/lib.rs::b", "kind": "function", "level": "L1", "signature": "fn b()", "tags": ["public"], "code": "pub fn b() {}" }
        ],
        "edges": [ { "from": "src/lib.rs::a", "to": "src/lib.rs::b", "kind": "calls" } ]
    }"#;

    #[test]
    fn test_parse_batch() {
        let batch = parse_batch(BATCH).unwrap();
        assert_eq!(batch.nodes.len(), 2);
        assert_eq!(batch.nodes[0].node.kind, NodeKind::Function);
        assert_eq!(batch.nodes[0].code, "fn a() { b() }");
        assert_eq!(batch.edges[0].kind, EdgeKind::Calls);
        assert!(matches!(parse_batch("{ nodes: 1 }"), Err(IngestError::Json(_))));
    }

    #[test]
    fn test_load_batch_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_batch(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, IngestError::Io { .. }));
    }

    #[tokio::test]
    async fn test_embed_missing_reuses_stored_vectors() {
        let store = GraphStore::new();
        let embedder = HashEmbedder::new(32);

        let mut batch = parse_batch(BATCH).unwrap();
        assert_eq!(embed_missing(&mut batch, &store, &embedder).await.unwrap(), 2);
        assert!(batch.nodes.iter().all(|n| n.node.embedding.is_some()));
        store.upsert_nodes(batch.nodes, batch.edges).unwrap();

        let mut again = parse_batch(BATCH).unwrap();
        assert_eq!(embed_missing(&mut again, &store, &embedder).await.unwrap(), 0);
        let outcome = store.upsert_nodes(again.nodes, again.edges).unwrap();
        assert!(outcome.is_unchanged());
    }
}
