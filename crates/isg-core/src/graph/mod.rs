//! Graph-vector store for interface nodes, edges and versioned code rows.
//!
//! # Components
//!
//! - [`GraphStore`] - authoritative in-memory store (copy-on-write snapshots)
//! - [`GraphDb`] - SurrealDB embedded persistence of [`GraphSnapshot`]s
//! - [`models`] - the logical schema (nodes, edges, rows, versions)
//!
//! Reads (traversal, vector search, row lookups) never wait on writers.
//! Code text only changes through [`GraphStore`]'s crate-private commit path,
//! which the safety gate drives.

mod db;
mod error;
pub mod models;
mod store;
mod traversal;
pub mod vector;

pub use db::GraphDb;
pub use error::StoreError;
pub use models::{
    body_hash, CandidateId, CodeGraphRow, Edge, EdgeFilter, EdgeKind, FileRewrite, FutureAction, GraphVersion,
    IngestBatch, IngestNode, IngestOutcome, InterfaceNode, Level, LevelFilter, LineEdit, NodeKey, NodeKind,
    NodeRef, RevisionReason, RowRevision, SourceSpan, StagedFuture, Tag, ValidationStatus,
};
pub use store::{GraphSnapshot, GraphStore, StoreStats};
pub(crate) use store::GraphState;
