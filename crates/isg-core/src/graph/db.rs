//! SurrealDB embedded persistence for the graph and pattern statistics.
//!
//! Every logical table stores one JSON-encoded record per row (`body`), so the
//! in-memory model round-trips losslessly regardless of how SurrealDB maps
//! individual field types.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::local::{Db, Mem, RocksDb};
use surrealdb::Surreal;
use tracing::debug;

use super::error::StoreError;
use super::store::GraphSnapshot;
use crate::config::{DB_NAME, DB_NAMESPACE};
use crate::patterns::{OutcomeEvent, PatternStats};

/// One persisted row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    key: String,
    seq: i64,
    body: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MetaRecord {
    value: String,
}

fn encode<T: Serialize>(items: &[T], key: impl Fn(&T) -> String) -> Result<Vec<Record>, StoreError> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            Ok(Record {
                key: key(item),
                seq: i as i64,
                body: serde_json::to_string(item)?,
            })
        })
        .collect()
}

fn decode<T: DeserializeOwned>(records: Vec<Record>) -> Result<Vec<T>, StoreError> {
    records
        .into_iter()
        .map(|r| serde_json::from_str(&r.body).map_err(StoreError::from))
        .collect()
}

/// Database connection for graph persistence.
pub struct GraphDb {
    db: Surreal<Db>,
}

impl GraphDb {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Surreal::new::<RocksDb>(path).await?;
        db.use_ns(DB_NAMESPACE).use_db(DB_NAME).await?;
        Ok(Self { db })
    }

    /// In-memory database, used by tests and `--ephemeral` runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = Surreal::new::<Mem>(()).await?;
        db.use_ns(DB_NAMESPACE).use_db(DB_NAME).await?;
        Ok(Self { db })
    }

    /// Define tables and indexes.
    pub async fn initialize_schema(&self) -> Result<(), StoreError> {
        // ===========================================================================
        // GRAPH TABLES
        // ===========================================================================

        self.db
            .query(
                r#"
                DEFINE TABLE IF NOT EXISTS node SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS node_key ON node FIELDS key UNIQUE;

                DEFINE TABLE IF NOT EXISTS edge SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS edge_key ON edge FIELDS key;

                DEFINE TABLE IF NOT EXISTS code_row SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS code_row_key ON code_row FIELDS key UNIQUE;

                DEFINE TABLE IF NOT EXISTS staged_future SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS staged_future_key ON staged_future FIELDS key;
                "#,
            )
            .await?
            .check()?;

        // ===========================================================================
        // HISTORY TABLES (append-only)
        // ===========================================================================

        self.db
            .query(
                r#"
                DEFINE TABLE IF NOT EXISTS row_revision SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS row_revision_key ON row_revision FIELDS key;

                DEFINE TABLE IF NOT EXISTS graph_version SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS graph_version_key ON graph_version FIELDS key UNIQUE;
                "#,
            )
            .await?
            .check()?;

        // ===========================================================================
        // PATTERN TABLES
        // ===========================================================================

        self.db
            .query(
                r#"
                DEFINE TABLE IF NOT EXISTS pattern_stats SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS pattern_stats_key ON pattern_stats FIELDS key UNIQUE;

                DEFINE TABLE IF NOT EXISTS pattern_outcome SCHEMALESS;
                DEFINE INDEX IF NOT EXISTS pattern_outcome_key ON pattern_outcome FIELDS key;
                "#,
            )
            .await?
            .check()?;

        // ===========================================================================
        // METADATA
        // ===========================================================================

        self.db
            .query(
                r#"
                DEFINE TABLE IF NOT EXISTS metadata SCHEMALESS;
                UPSERT metadata:initialized CONTENT { key: 'initialized', value: 'true', updated_at: time::now() };
                UPSERT metadata:schema_version CONTENT { key: 'schema_version', value: '1', updated_at: time::now() };
                "#,
            )
            .await?
            .check()?;

        Ok(())
    }

    /// Check if the database has been initialized.
    pub async fn is_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.meta("initialized").await?.is_some())
    }

    async fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let found: Vec<MetaRecord> = self
            .db
            .query("SELECT value FROM metadata WHERE key = $key")
            .bind(("key", key.to_string()))
            .await?
            .take(0)?;
        Ok(found.into_iter().next().map(|m| m.value))
    }

    async fn load_table<T: DeserializeOwned>(&self, table: &'static str) -> Result<Vec<T>, StoreError> {
        let records: Vec<Record> = self
            .db
            .query(format!("SELECT key, seq, body FROM {table} ORDER BY seq"))
            .await?
            .take(0)?;
        decode(records)
    }

    /// Replace the persisted graph with `snapshot` in one transaction.
    pub async fn save_snapshot(&self, snapshot: &GraphSnapshot) -> Result<(), StoreError> {
        let nodes = encode(&snapshot.nodes, |n| n.key.to_string())?;
        let edges = encode(&snapshot.edges, |e| e.from.to_string())?;
        let rows = encode(&snapshot.rows, |r| r.key.to_string())?;
        let staged = encode(&snapshot.staged, |f| f.key.to_string())?;
        let revisions = encode(&snapshot.history, |r| r.key.to_string())?;
        let versions = encode(&snapshot.versions, |v| v.number.to_string())?;

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE node;
                DELETE edge;
                DELETE code_row;
                DELETE staged_future;
                DELETE row_revision;
                DELETE graph_version;
                FOR $r IN $nodes { CREATE node CONTENT $r; };
                FOR $r IN $edges { CREATE edge CONTENT $r; };
                FOR $r IN $rows { CREATE code_row CONTENT $r; };
                FOR $r IN $staged { CREATE staged_future CONTENT $r; };
                FOR $r IN $revisions { CREATE row_revision CONTENT $r; };
                FOR $r IN $versions { CREATE graph_version CONTENT $r; };
                UPSERT metadata:head CONTENT { key: 'head', value: $head, updated_at: time::now() };
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("nodes", nodes))
            .bind(("edges", edges))
            .bind(("rows", rows))
            .bind(("staged", staged))
            .bind(("revisions", revisions))
            .bind(("versions", versions))
            .bind(("head", snapshot.head.to_string()))
            .await?
            .check()?;

        debug!(head = snapshot.head, nodes = snapshot.nodes.len(), "Saved graph snapshot");
        Ok(())
    }

    /// Load the persisted graph, if one was ever saved.
    pub async fn load_snapshot(&self) -> Result<Option<GraphSnapshot>, StoreError> {
        let Some(head) = self.meta("head").await? else {
            return Ok(None);
        };
        let head = head
            .parse::<u64>()
            .map_err(|e| StoreError::Database(format!("bad head marker {head:?}: {e}")))?;

        Ok(Some(GraphSnapshot {
            head,
            nodes: self.load_table("node").await?,
            edges: self.load_table("edge").await?,
            rows: self.load_table("code_row").await?,
            staged: self.load_table("staged_future").await?,
            versions: self.load_table("graph_version").await?,
            history: self.load_table("row_revision").await?,
        }))
    }

    /// Replace the persisted pattern counters.
    pub async fn save_pattern_stats(&self, stats: &[PatternStats]) -> Result<(), StoreError> {
        let records = encode(stats, |s| s.pattern_id.clone())?;
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE pattern_stats;
                FOR $r IN $records { CREATE pattern_stats CONTENT $r; };
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("records", records))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn load_pattern_stats(&self) -> Result<Vec<PatternStats>, StoreError> {
        self.load_table("pattern_stats").await
    }

    /// Append one effectiveness event. Events are never rewritten.
    pub async fn append_outcome(&self, event: &OutcomeEvent) -> Result<(), StoreError> {
        let record = Record {
            key: event.pattern_id.clone(),
            seq: event.seq as i64,
            body: serde_json::to_string(event)?,
        };
        self.db
            .query("CREATE pattern_outcome CONTENT $record RETURN NONE")
            .bind(("record", record))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn load_outcomes(&self) -> Result<Vec<OutcomeEvent>, StoreError> {
        self.load_table("pattern_outcome").await
    }
}
