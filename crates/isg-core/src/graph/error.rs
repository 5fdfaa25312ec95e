//! Graph store error types.

use thiserror::Error;

use super::models::NodeKey;

/// Structural integrity errors raised by the graph store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A key is bound to two different nodes.
    #[error("Key collision on {key}: {reason}")]
    KeyCollision { key: NodeKey, reason: String },

    /// An edge or parent link references a missing node.
    #[error("Inconsistent graph: {0}")]
    Inconsistent(String),

    /// Another write holds or moved one of the target rows.
    #[error("Concurrent write conflict on {}", format_keys(.keys))]
    ConcurrentWriteConflict { keys: Vec<NodeKey> },

    /// No code row (or no staged future) for the key.
    #[error("No code row for {0}")]
    MissingRow(NodeKey),

    /// Version number never existed.
    #[error("Unknown graph version {0}")]
    UnknownVersion(u64),

    /// Version exists but its snapshot is not retained.
    #[error("Rollback to version {0} is not available")]
    RollbackUnavailable(u64),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Snapshot encoding error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn conflict(keys: impl IntoIterator<Item = NodeKey>) -> Self {
        StoreError::ConcurrentWriteConflict {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrentWriteConflict { .. })
    }
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

fn format_keys(keys: &[NodeKey]) -> String {
    keys.iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
