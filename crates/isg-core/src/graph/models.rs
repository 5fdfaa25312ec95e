//! Data model of the interface signature graph.
//!
//! Nodes and edges describe the code interfaces of one repository checkout.
//! [`CodeGraphRow`] is the only entity carrying code text with write
//! semantics; everything else is rebuilt from ingest.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable, content-independent identifier of an interface node.
///
/// Keys have the shape `<file>::<scope…>::<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from a file path, the enclosing scopes and an item name.
    pub fn derive(file: &str, scope: &[String], name: &str) -> Self {
        let mut key = String::from(file);
        for segment in scope {
            key.push_str("::");
            key.push_str(segment);
        }
        key.push_str("::");
        key.push_str(name);
        Self(key)
    }

    /// Nested key for a child item.
    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}::{}", self.0, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last `::` segment.
    pub fn name(&self) -> &str {
        self.0.rsplit("::").next().unwrap_or(&self.0)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of code interface a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Function,
    Method,
    Struct,
    Enum,
    Trait,
    Impl,
    Module,
    TypeAlias,
    Constant,
    Field,
    Variant,
    Feature,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Function => "fn",
            NodeKind::Method => "method",
            NodeKind::Struct => "struct",
            NodeKind::Enum => "enum",
            NodeKind::Trait => "trait",
            NodeKind::Impl => "impl",
            NodeKind::Module => "mod",
            NodeKind::TypeAlias => "type",
            NodeKind::Constant => "const",
            NodeKind::Field => "field",
            NodeKind::Variant => "variant",
            NodeKind::Feature => "feature",
        }
    }
}

/// Tier of a node in the three-level hierarchy.
///
/// Level-1 nodes are addressable; Level-2/3 nodes only enrich their
/// Level-1 ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    L1,
    L2,
    L3,
}

impl Level {
    /// Level priority term used in retrieval ranking.
    pub fn priority(&self) -> f32 {
        match self {
            Level::L1 => 1.0,
            Level::L2 => 0.5,
            Level::L3 => 0.25,
        }
    }

    /// The level a direct parent must have.
    pub fn parent_level(&self) -> Option<Level> {
        match self {
            Level::L1 => None,
            Level::L2 => Some(Level::L1),
            Level::L3 => Some(Level::L2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Public,
    Unsafe,
    Async,
    Test,
}

/// Line range of an item in its source file (1-based, inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub file: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl SourceSpan {
    pub fn new(file: impl Into<String>, start_line: usize, end_line: usize) -> Self {
        Self {
            file: file.into(),
            start_line,
            end_line,
        }
    }

    pub fn contains(&self, file: &str, line: usize) -> bool {
        self.file == file && self.start_line <= line && line <= self.end_line
    }

    pub fn len(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end_line < self.start_line
    }
}

/// Lines `old_start..=old_end` of a file replaced by `new_start..=new_end`.
///
/// An empty old range (`old_end == old_start - 1`) is an insertion before
/// `old_start`; an empty new range is a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEdit {
    pub key: NodeKey,
    pub old_start: usize,
    pub old_end: usize,
    pub new_start: usize,
    pub new_end: usize,
}

impl LineEdit {
    /// Change in line count.
    pub fn growth(&self) -> isize {
        let new_len = (self.new_end + 1).saturating_sub(self.new_start) as isize;
        let old_len = (self.old_end + 1).saturating_sub(self.old_start) as isize;
        new_len - old_len
    }

    /// Lies wholly above `line`.
    fn before(&self, line: usize) -> bool {
        self.old_end < line
    }

    /// Lies within `start..=end`.
    fn within(&self, start: usize, end: usize) -> bool {
        start <= self.old_start && self.old_start <= end && self.old_end <= end
    }
}

/// A source file as rewritten by one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRewrite {
    pub file: String,
    pub content: String,
    /// Ascending, non-overlapping.
    pub edits: Vec<LineEdit>,
}

impl FileRewrite {
    /// Where `span` sits after the rewrite.
    ///
    /// `None` when an edit cuts through the span or the span was itself
    /// replaced; spans enclosing whole edits stretch or shrink with them.
    pub fn relocate(&self, key: &NodeKey, span: &SourceSpan) -> Option<SourceSpan> {
        if span.file != self.file {
            return Some(span.clone());
        }
        if let Some(own) = self.edits.iter().find(|e| &e.key == key) {
            return (own.new_end >= own.new_start).then(|| SourceSpan::new(&self.file, own.new_start, own.new_end));
        }

        let (start, end) = (span.start_line, span.end_line);
        let mut shift_start = 0isize;
        let mut shift_end = 0isize;
        for edit in &self.edits {
            if edit.before(start) {
                shift_start += edit.growth();
                shift_end += edit.growth();
            } else if edit.within(start, end) {
                shift_end += edit.growth();
            } else if edit.old_start <= end {
                return None;
            }
        }
        let start = start as isize + shift_start;
        let end = end as isize + shift_end;
        (start >= 1 && end >= start).then(|| SourceSpan::new(&self.file, start as usize, end as usize))
    }

    /// True when some edit falls inside `span` without being `key` itself.
    pub fn encloses_edit(&self, key: &NodeKey, span: &SourceSpan) -> bool {
        span.file == self.file
            && self
                .edits
                .iter()
                .any(|e| &e.key != key && e.within(span.start_line, span.end_line))
    }

    /// Text of `span` in the rewritten file.
    pub fn text(&self, span: &SourceSpan) -> String {
        self.content
            .lines()
            .skip(span.start_line.saturating_sub(1))
            .take(span.len())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One code interface in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceNode {
    pub key: NodeKey,
    pub kind: NodeKind,
    pub level: Level,
    /// Direct parent (Level-2/3 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeKey>,
    pub signature: String,
    /// sha256 of the body text, hex encoded.
    #[serde(default)]
    pub body_hash: String,
    #[serde(default)]
    pub tags: BTreeSet<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SourceSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl InterfaceNode {
    pub fn new(key: impl Into<NodeKey>, kind: NodeKind, signature: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            level: Level::L1,
            parent: None,
            signature: signature.into(),
            body_hash: String::new(),
            tags: BTreeSet::new(),
            doc: None,
            span: None,
            embedding: None,
        }
    }

    /// Nest this node under `parent` at the given level.
    pub fn nested(mut self, parent: impl Into<NodeKey>, level: Level) -> Self {
        self.parent = Some(parent.into());
        self.level = level;
        self
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.insert(tag);
        self
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.tags.contains(&tag)
    }

    /// Short text describing the node, used for embeddings and shortlists.
    pub fn summary(&self) -> String {
        match &self.doc {
            Some(doc) if !doc.is_empty() => {
                let first = doc.lines().next().unwrap_or_default().trim();
                format!("{} {}: {}", self.kind.as_str(), self.signature, first)
            }
            _ => format!("{} {}", self.kind.as_str(), self.signature),
        }
    }

    /// Same node, ignoring the embedding.
    pub(crate) fn same_shape(&self, other: &InterfaceNode) -> bool {
        self.key == other.key
            && self.kind == other.kind
            && self.level == other.level
            && self.parent == other.parent
            && self.signature == other.signature
            && self.body_hash == other.body_hash
            && self.tags == other.tags
            && self.doc == other.doc
            && self.span == other.span
    }
}

/// Hex sha256 of a body text.
pub fn body_hash(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Closed set of edge types.
///
/// Declaration order is the traversal tie-break priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Calls,
    DependsOn,
    Implements,
    Uses,
    RequiresBound,
    FeatureGatedBy,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 6] = [
        EdgeKind::Calls,
        EdgeKind::DependsOn,
        EdgeKind::Implements,
        EdgeKind::Uses,
        EdgeKind::RequiresBound,
        EdgeKind::FeatureGatedBy,
    ];

    /// Lower is preferred.
    pub fn priority(&self) -> u8 {
        *self as u8
    }
}

/// Directed relation between two node keys. Edges have no identity of their own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeKey,
    pub to: NodeKey,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(from: impl Into<NodeKey>, to: impl Into<NodeKey>, kind: EdgeKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
        }
    }
}

/// Which edge kinds a traversal follows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EdgeFilter {
    #[default]
    All,
    Only(BTreeSet<EdgeKind>),
}

impl EdgeFilter {
    pub fn only(kinds: impl IntoIterator<Item = EdgeKind>) -> Self {
        EdgeFilter::Only(kinds.into_iter().collect())
    }

    pub fn allows(&self, kind: EdgeKind) -> bool {
        match self {
            EdgeFilter::All => true,
            EdgeFilter::Only(kinds) => kinds.contains(&kind),
        }
    }
}

/// Which levels a vector search returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelFilter {
    /// Level-1 only.
    #[default]
    Primary,
    Any,
    Exactly(Level),
    UpTo(Level),
}

impl LevelFilter {
    pub fn allows(&self, level: Level) -> bool {
        match self {
            LevelFilter::Primary => level == Level::L1,
            LevelFilter::Any => true,
            LevelFilter::Exactly(l) => level == *l,
            LevelFilter::UpTo(l) => level <= *l,
        }
    }
}

/// Lightweight reference to a node returned by graph reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub key: NodeKey,
    pub kind: NodeKind,
    pub level: Level,
    /// Hop count from the nearest seed, for traversal results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops: Option<u8>,
    /// Edge kind of the preferred path, for traversal results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<EdgeKind>,
}

impl NodeRef {
    pub fn of(node: &InterfaceNode) -> Self {
        Self {
            key: node.key.clone(),
            kind: node.kind,
            level: node.level,
            hops: None,
            via: None,
        }
    }
}

/// Pending change kind of a code row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureAction {
    #[default]
    None,
    Create,
    Edit,
    Delete,
}

impl FutureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FutureAction::None => "none",
            FutureAction::Create => "create",
            FutureAction::Edit => "edit",
            FutureAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    DiagnosticsOk,
    BuildOk,
    TestsOk,
    Failed,
}

/// Identifier of a candidate diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub Uuid);

impl CandidateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for CandidateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(CandidateId)
    }
}

/// The single write surface for code text.
///
/// `future_code` is `Some` iff `future_action != None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeGraphRow {
    pub key: NodeKey,
    pub current_code: String,
    pub future_code: Option<String>,
    pub future_action: FutureAction,
    pub validation_status: ValidationStatus,
    pub candidate_diff_id: Option<CandidateId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeGraphRow {
    pub(crate) fn new(key: NodeKey, code: String, version: u64) -> Self {
        let now = Utc::now();
        Self {
            key,
            current_code: code,
            future_code: None,
            future_action: FutureAction::None,
            validation_status: ValidationStatus::Pending,
            candidate_diff_id: None,
            version,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_future(&self) -> bool {
        self.future_action != FutureAction::None
    }
}

/// A future staged for a row by one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedFuture {
    pub key: NodeKey,
    pub candidate: CandidateId,
    pub action: FutureAction,
    pub code: String,
    pub status: ValidationStatus,
    /// Row version observed when the future was staged (0 for creates).
    pub base_version: u64,
    pub staged_at: DateTime<Utc>,
}

/// Immutable marker of one committed graph state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphVersion {
    pub number: u64,
    pub parent: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    pub rollback_available: bool,
    /// Rows flipped by this version.
    #[serde(default)]
    pub rows: Vec<NodeKey>,
}

/// Why a row revision was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionReason {
    Ingest,
    Commit,
    Rollback,
}

/// Append-only history entry, keyed by (node key, row version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRevision {
    pub key: NodeKey,
    pub version: u64,
    pub graph_version: u64,
    /// Code after the revision; `None` once the row was deleted.
    pub code: Option<String>,
    pub action: FutureAction,
    pub candidate: Option<CandidateId>,
    pub reason: RevisionReason,
    pub recorded_at: DateTime<Utc>,
}

/// One ingest record: a node plus its body text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestNode {
    #[serde(flatten)]
    pub node: InterfaceNode,
    #[serde(default)]
    pub code: String,
}

impl IngestNode {
    pub fn new(node: InterfaceNode, code: impl Into<String>) -> Self {
        Self {
            node,
            code: code.into(),
        }
    }
}

/// Batch ingest payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    #[serde(default)]
    pub nodes: Vec<IngestNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// What an ingest changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub nodes_added: usize,
    pub nodes_updated: usize,
    pub rows_refreshed: usize,
    pub edges_added: usize,
    /// Version created by the ingest, if anything changed.
    pub version: Option<GraphVersion>,
}

impl IngestOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.version.is_none()
    }
}
