//! In-memory graph-vector store with versioned code rows.
//!
//! The live graph is an immutable [`GraphState`] behind an `Arc`. Readers
//! clone the `Arc` and never block writers for longer than a pointer copy;
//! writers build the next state copy-on-write and publish it with a single
//! swap, so a commit is observed either entirely or not at all.
//!
//! Writers are serialised by the ledger mutex. Commits additionally claim an
//! intent lock on their exact row set and fail fast with
//! [`StoreError::ConcurrentWriteConflict`] when another write holds one of
//! the rows.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::StoreError;
use super::models::{
    body_hash, CandidateId, CodeGraphRow, Edge, EdgeFilter, EdgeKind, FileRewrite, FutureAction, GraphVersion,
    IngestNode, IngestOutcome, InterfaceNode, LevelFilter, NodeKey, NodeRef, RevisionReason,
    RowRevision, StagedFuture, ValidationStatus,
};
use super::{traversal, vector};
use crate::config::DEFAULT_MAX_HOPS;

/// One immutable graph state.
#[derive(Debug, Clone, Default)]
pub(crate) struct GraphState {
    /// Graph version this state was published as (0 = empty genesis).
    pub(crate) version: u64,
    pub(crate) nodes: BTreeMap<NodeKey, Arc<InterfaceNode>>,
    pub(crate) edges: BTreeSet<Edge>,
    pub(crate) outgoing: BTreeMap<NodeKey, Vec<(NodeKey, EdgeKind)>>,
    pub(crate) incoming: BTreeMap<NodeKey, Vec<(NodeKey, EdgeKind)>>,
    /// Committed rows. Pending futures live in `staged`.
    pub(crate) rows: BTreeMap<NodeKey, Arc<CodeGraphRow>>,
    /// Futures per row, in staging order.
    pub(crate) staged: BTreeMap<NodeKey, Vec<StagedFuture>>,
}

impl GraphState {
    pub(crate) fn insert_node(&mut self, node: InterfaceNode) {
        self.nodes.insert(node.key.clone(), Arc::new(node));
    }

    pub(crate) fn rebuild_adjacency(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
        for edge in &self.edges {
            self.outgoing
                .entry(edge.from.clone())
                .or_default()
                .push((edge.to.clone(), edge.kind));
            self.incoming
                .entry(edge.to.clone())
                .or_default()
                .push((edge.from.clone(), edge.kind));
        }
    }

    /// Neighbours over both edge directions.
    pub(crate) fn neighbours<'a>(
        &'a self,
        key: &NodeKey,
    ) -> impl Iterator<Item = &'a (NodeKey, EdgeKind)> + 'a {
        self.outgoing
            .get(key)
            .into_iter()
            .flatten()
            .chain(self.incoming.get(key).into_iter().flatten())
    }

    /// Every edge endpoint and parent link must resolve, and nested nodes must
    /// sit exactly one level below their parent.
    pub(crate) fn check_integrity(&self) -> Result<(), StoreError> {
        for node in self.nodes.values() {
            match (node.level.parent_level(), &node.parent) {
                (None, None) => {}
                (None, Some(parent)) => {
                    return Err(StoreError::Inconsistent(format!(
                        "level-1 node {} cannot have parent {}",
                        node.key, parent
                    )));
                }
                (Some(_), None) => {
                    return Err(StoreError::Inconsistent(format!(
                        "{} has no level-1 ancestor",
                        node.key
                    )));
                }
                (Some(expected), Some(parent)) => match self.nodes.get(parent) {
                    Some(p) if p.level == expected => {}
                    Some(p) => {
                        return Err(StoreError::Inconsistent(format!(
                            "{} is {:?} but its parent {} is {:?}",
                            node.key, node.level, parent, p.level
                        )));
                    }
                    None => {
                        return Err(StoreError::Inconsistent(format!(
                            "{} references missing parent {}",
                            node.key, parent
                        )));
                    }
                },
            }
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(end) {
                    return Err(StoreError::Inconsistent(format!(
                        "edge {} -{:?}-> {} references missing node {}",
                        edge.from, edge.kind, edge.to, end
                    )));
                }
            }
        }

        Ok(())
    }

    /// Remove a node with all its descendants and touching edges.
    fn remove_subtree(&mut self, key: &NodeKey) -> Vec<NodeKey> {
        let mut doomed = vec![key.clone()];
        let mut i = 0;
        while i < doomed.len() {
            let current = doomed[i].clone();
            doomed.extend(
                self.nodes
                    .values()
                    .filter(|n| n.parent.as_ref() == Some(&current))
                    .map(|n| n.key.clone()),
            );
            i += 1;
        }

        let set: HashSet<&NodeKey> = doomed.iter().collect();
        self.edges
            .retain(|e| !set.contains(&e.from) && !set.contains(&e.to));
        for k in &doomed {
            self.nodes.remove(k);
        }
        doomed
    }

    fn row_view(&self, key: &NodeKey, candidate: Option<CandidateId>) -> Option<CodeGraphRow> {
        let staged = self.staged.get(key).and_then(|futures| match candidate {
            Some(id) => futures.iter().find(|f| f.candidate == id),
            None => futures.last(),
        });

        let base = match (self.rows.get(key), staged) {
            (Some(row), _) => (**row).clone(),
            (None, Some(future)) if future.action == FutureAction::Create => {
                let mut row = CodeGraphRow::new(key.clone(), String::new(), 0);
                row.created_at = future.staged_at;
                row.updated_at = future.staged_at;
                row
            }
            _ => return None,
        };

        Some(match staged {
            Some(future) => with_future(base, future),
            None if candidate.is_some() => return None,
            None => base,
        })
    }
}

fn with_future(mut row: CodeGraphRow, future: &StagedFuture) -> CodeGraphRow {
    row.future_code = Some(future.code.clone());
    row.future_action = future.action;
    row.validation_status = future.status;
    row.candidate_diff_id = Some(future.candidate);
    row
}

/// Serialisable image of the whole store: the logical schema plus history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub head: u64,
    pub nodes: Vec<InterfaceNode>,
    pub edges: Vec<Edge>,
    pub rows: Vec<CodeGraphRow>,
    #[serde(default)]
    pub staged: Vec<StagedFuture>,
    pub versions: Vec<GraphVersion>,
    #[serde(default)]
    pub history: Vec<RowRevision>,
}

/// Counts describing the live graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub head: u64,
    pub nodes: usize,
    pub edges: usize,
    pub rows: usize,
    pub staged: usize,
    pub versions: usize,
}

/// Append-only bookkeeping owned by the single writer.
#[derive(Debug, Default)]
struct Ledger {
    versions: Vec<GraphVersion>,
    snapshots: BTreeMap<u64, Arc<GraphState>>,
    history: BTreeMap<NodeKey, Vec<RowRevision>>,
    row_high_water: HashMap<NodeKey, u64>,
    next_version: u64,
}

impl Ledger {
    fn genesis() -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, Arc::new(GraphState::default()));
        Self {
            snapshots,
            next_version: 1,
            ..Default::default()
        }
    }

    /// Next row version for `key`, monotonic across rollbacks.
    fn bump(&mut self, key: &NodeKey, live: u64) -> u64 {
        let hw = self.row_high_water.entry(key.clone()).or_insert(0);
        *hw = (*hw).max(live) + 1;
        *hw
    }

    fn append(&mut self, revisions: Vec<RowRevision>) {
        for revision in revisions {
            self.history
                .entry(revision.key.clone())
                .or_default()
                .push(revision);
        }
    }

    fn publish(&mut self, version: GraphVersion, state: Arc<GraphState>) {
        self.next_version = self.next_version.max(version.number + 1);
        self.snapshots.insert(version.number, state);
        self.versions.push(version);
    }
}

/// Releases claimed row intents on drop.
struct IntentGuard<'a> {
    intents: &'a Mutex<HashSet<NodeKey>>,
    keys: Vec<NodeKey>,
}

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.intents.lock();
        for key in &self.keys {
            held.remove(key);
        }
    }
}

/// The graph-vector store.
#[derive(Debug)]
pub struct GraphStore {
    head: RwLock<Arc<GraphState>>,
    ledger: Mutex<Ledger>,
    intents: Mutex<HashSet<NodeKey>>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    /// Empty store at genesis (version 0).
    pub fn new() -> Self {
        Self {
            head: RwLock::new(Arc::new(GraphState::default())),
            ledger: Mutex::new(Ledger::genesis()),
            intents: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn state(&self) -> Arc<GraphState> {
        Arc::clone(&self.head.read())
    }

    fn publish_head(&self, state: Arc<GraphState>) {
        *self.head.write() = state;
    }

    fn claim(&self, keys: &[NodeKey]) -> Result<IntentGuard<'_>, StoreError> {
        let mut held = self.intents.lock();
        let clash: Vec<NodeKey> = keys.iter().filter(|k| held.contains(*k)).cloned().collect();
        if !clash.is_empty() {
            return Err(StoreError::conflict(clash));
        }
        held.extend(keys.iter().cloned());
        Ok(IntentGuard {
            intents: &self.intents,
            keys: keys.to_vec(),
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current head version.
    pub fn head(&self) -> u64 {
        self.state().version
    }

    pub fn get_node(&self, key: &NodeKey) -> Option<InterfaceNode> {
        self.state().nodes.get(key).map(|n| (**n).clone())
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.state().nodes.contains_key(key)
    }

    /// Row for `key`, showing the most recently staged future if any.
    pub fn get_row(&self, key: &NodeKey) -> Option<CodeGraphRow> {
        self.state().row_view(key, None)
    }

    /// Row for `key` as staged by one candidate.
    pub fn get_candidate_row(&self, key: &NodeKey, candidate: CandidateId) -> Option<CodeGraphRow> {
        self.state().row_view(key, Some(candidate))
    }

    /// Futures staged by `candidate`.
    pub fn staged_for(&self, candidate: CandidateId) -> Vec<StagedFuture> {
        self.state()
            .staged
            .values()
            .flatten()
            .filter(|f| f.candidate == candidate)
            .cloned()
            .collect()
    }

    pub fn has_staged(&self) -> bool {
        !self.state().staged.is_empty()
    }

    /// Bounded two-hop traversal from `seeds`.
    pub fn two_hop(&self, seeds: &[NodeKey], filter: &EdgeFilter, max_per_hop: usize) -> Vec<NodeRef> {
        self.traverse(seeds, filter, max_per_hop, DEFAULT_MAX_HOPS)
    }

    pub fn traverse(
        &self,
        seeds: &[NodeKey],
        filter: &EdgeFilter,
        max_per_hop: usize,
        max_hops: u8,
    ) -> Vec<NodeRef> {
        traversal::traverse(&self.state(), seeds, filter, max_per_hop, max_hops)
    }

    /// Nodes reachable from `keys` within two hops over any edge kind.
    pub fn blast_radius(&self, keys: &[NodeKey], max_per_hop: usize) -> Vec<NodeRef> {
        self.two_hop(keys, &EdgeFilter::All, max_per_hop)
    }

    /// Everything that transitively depends on `keys`.
    pub fn dependents_closure(&self, keys: &[NodeKey]) -> BTreeSet<NodeKey> {
        traversal::dependents_closure(&self.state(), keys)
    }

    /// The `k` nearest embedded nodes to `query`.
    pub fn vector_search(&self, query: &[f32], k: usize, level_filter: LevelFilter) -> Vec<(NodeRef, f32)> {
        let state = self.state();
        vector::nearest(state.nodes.values().map(|n| n.as_ref()), query, k, level_filter)
    }

    /// Most specific node whose span covers `line` of `file`.
    pub fn node_at(&self, file: &str, line: usize) -> Option<NodeKey> {
        let state = self.state();
        state
            .nodes
            .values()
            .filter_map(|n| n.span.as_ref().map(|s| (n, s)))
            .filter(|(_, span)| span.contains(file, line))
            .min_by(|(a, sa), (b, sb)| {
                sa.len()
                    .cmp(&sb.len())
                    .then_with(|| b.level.cmp(&a.level))
                    .then_with(|| a.key.cmp(&b.key))
            })
            .map(|(n, _)| n.key.clone())
    }

    pub fn nodes_in_file(&self, file: &str) -> Vec<InterfaceNode> {
        self.state()
            .nodes
            .values()
            .filter(|n| n.span.as_ref().is_some_and(|s| s.file == file))
            .map(|n| (**n).clone())
            .collect()
    }

    /// All version records, oldest first.
    pub fn versions(&self) -> Vec<GraphVersion> {
        self.ledger.lock().versions.clone()
    }

    /// Revisions of one row, oldest first.
    pub fn row_history(&self, key: &NodeKey) -> Vec<RowRevision> {
        self.ledger
            .lock()
            .history
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state();
        StoreStats {
            head: state.version,
            nodes: state.nodes.len(),
            edges: state.edges.len(),
            rows: state.rows.len(),
            staged: state.staged.values().map(Vec::len).sum(),
            versions: self.ledger.lock().versions.len(),
        }
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Upsert a batch of nodes and edges.
    ///
    /// The whole batch is rejected on any structural error. Unchanged
    /// content (same body hash, same metadata, no new edges) produces no
    /// version. Changed bodies refresh `current_code` as a new version.
    pub fn upsert_nodes(&self, nodes: Vec<IngestNode>, edges: Vec<Edge>) -> Result<IngestOutcome, StoreError> {
        let mut batch: BTreeMap<NodeKey, IngestNode> = BTreeMap::new();
        for mut item in nodes {
            item.node.body_hash = body_hash(&item.code);
            match batch.get(&item.node.key) {
                Some(seen) if seen.node.same_shape(&item.node) && seen.code == item.code => {}
                Some(_) => {
                    return Err(StoreError::KeyCollision {
                        key: item.node.key.clone(),
                        reason: "batch carries the key twice with different content".to_string(),
                    });
                }
                None => {
                    batch.insert(item.node.key.clone(), item);
                }
            }
        }

        let mut ledger = self.ledger.lock();
        let current = self.state();

        for (key, item) in &batch {
            if let Some(existing) = current.nodes.get(key) {
                if existing.kind != item.node.kind {
                    return Err(StoreError::KeyCollision {
                        key: key.clone(),
                        reason: format!(
                            "already bound to a {} node, batch has a {}",
                            existing.kind.as_str(),
                            item.node.kind.as_str()
                        ),
                    });
                }
            }
        }

        let mut next = (*current).clone();
        let mut outcome = IngestOutcome::default();
        let mut row_writes: Vec<(NodeKey, String)> = Vec::new();

        for (key, item) in batch {
            let IngestNode { mut node, code } = item;
            match current.nodes.get(&key) {
                None => {
                    outcome.nodes_added += 1;
                    let row_differs = current
                        .rows
                        .get(&key)
                        .map_or(true, |row| row.current_code != code);
                    if row_differs {
                        row_writes.push((key.clone(), code));
                    }
                    next.insert_node(node);
                }
                Some(existing) => {
                    if node.embedding.is_none() {
                        node.embedding = existing.embedding.clone();
                    }
                    if existing.body_hash != node.body_hash || !current.rows.contains_key(&key) {
                        row_writes.push((key.clone(), code));
                    }
                    if !existing.same_shape(&node) || existing.embedding != node.embedding {
                        outcome.nodes_updated += 1;
                        next.insert_node(node);
                    }
                }
            }
        }

        for edge in edges {
            if next.edges.insert(edge) {
                outcome.edges_added += 1;
            }
        }

        if outcome.nodes_added == 0 && outcome.nodes_updated == 0 && outcome.edges_added == 0 && row_writes.is_empty() {
            debug!("Ingest produced no changes");
            return Ok(outcome);
        }

        next.rebuild_adjacency();
        next.check_integrity()?;

        let refreshed: Vec<NodeKey> = row_writes
            .iter()
            .filter(|(k, _)| current.rows.contains_key(k))
            .map(|(k, _)| k.clone())
            .collect();
        let pending: Vec<NodeKey> = refreshed
            .iter()
            .filter(|k| current.staged.contains_key(*k))
            .cloned()
            .collect();
        if !pending.is_empty() {
            return Err(StoreError::conflict(pending));
        }
        let _intent = self.claim(&refreshed)?;

        let number = ledger.next_version;
        let now = Utc::now();
        let mut revisions = Vec::with_capacity(row_writes.len());
        let mut touched = Vec::with_capacity(row_writes.len());

        for (key, code) in row_writes {
            let live = current.rows.get(&key).map_or(0, |r| r.version);
            let version = ledger.bump(&key, live);
            let row = match current.rows.get(&key) {
                Some(old) => {
                    let mut row = (**old).clone();
                    row.current_code = code.clone();
                    row.version = version;
                    row.updated_at = now;
                    row
                }
                None => CodeGraphRow::new(key.clone(), code.clone(), version),
            };
            next.rows.insert(key.clone(), Arc::new(row));
            revisions.push(RowRevision {
                key: key.clone(),
                version,
                graph_version: number,
                code: Some(code),
                action: FutureAction::None,
                candidate: None,
                reason: RevisionReason::Ingest,
                recorded_at: now,
            });
            touched.push(key);
        }
        outcome.rows_refreshed = refreshed.len();

        next.version = number;
        let version = GraphVersion {
            number,
            parent: parent_of(current.version),
            created_at: now,
            summary: format!(
                "ingest: {} added, {} updated, {} rows refreshed, {} edges added",
                outcome.nodes_added, outcome.nodes_updated, outcome.rows_refreshed, outcome.edges_added
            ),
            rollback_available: true,
            rows: touched,
        };

        let next = Arc::new(next);
        ledger.append(revisions);
        ledger.publish(version.clone(), Arc::clone(&next));
        self.publish_head(next);

        info!(version = number, summary = %version.summary, "Ingested batch");
        outcome.version = Some(version);
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Candidate writes (gate only)
    // ------------------------------------------------------------------

    /// Stage futures for a candidate, all or nothing.
    pub(crate) fn stage(
        &self,
        candidate: CandidateId,
        entries: Vec<(NodeKey, FutureAction, String)>,
    ) -> Result<Vec<StagedFuture>, StoreError> {
        let _ledger = self.ledger.lock();
        let current = self.state();
        let now = Utc::now();

        let mut staged = Vec::with_capacity(entries.len());
        for (key, action, code) in entries {
            let base_version = match action {
                FutureAction::None => {
                    return Err(StoreError::Inconsistent(format!(
                        "cannot stage an empty action for {key}"
                    )));
                }
                FutureAction::Create => {
                    if current.nodes.contains_key(&key) || current.rows.contains_key(&key) {
                        return Err(StoreError::KeyCollision {
                            key,
                            reason: "create targets an existing key".to_string(),
                        });
                    }
                    0
                }
                FutureAction::Edit | FutureAction::Delete => current
                    .rows
                    .get(&key)
                    .map(|r| r.version)
                    .ok_or_else(|| StoreError::MissingRow(key.clone()))?,
            };
            let code = if action == FutureAction::Delete { String::new() } else { code };
            staged.push(StagedFuture {
                key,
                candidate,
                action,
                code,
                status: ValidationStatus::Pending,
                base_version,
                staged_at: now,
            });
        }

        let mut next = (*current).clone();
        for future in &staged {
            let futures = next.staged.entry(future.key.clone()).or_default();
            futures.retain(|f| f.candidate != candidate);
            futures.push(future.clone());
        }
        self.publish_head(Arc::new(next));

        debug!(candidate = %candidate, rows = staged.len(), "Staged futures");
        Ok(staged)
    }

    pub(crate) fn set_validation_status(&self, candidate: CandidateId, status: ValidationStatus) {
        let _ledger = self.ledger.lock();
        let current = self.state();
        let mut next = (*current).clone();
        let mut changed = false;
        for future in next.staged.values_mut().flatten() {
            if future.candidate == candidate && future.status != status {
                future.status = status;
                changed = true;
            }
        }
        if changed {
            self.publish_head(Arc::new(next));
        }
    }

    /// Drop every future staged by `candidate`. `current_code` is untouched.
    pub(crate) fn clear_future(&self, candidate: CandidateId) -> Vec<NodeKey> {
        let _ledger = self.ledger.lock();
        let current = self.state();
        let mut next = (*current).clone();
        let mut cleared = Vec::new();
        next.staged.retain(|key, futures| {
            let before = futures.len();
            futures.retain(|f| f.candidate != candidate);
            if futures.len() != before {
                cleared.push(key.clone());
            }
            !futures.is_empty()
        });
        if !cleared.is_empty() {
            self.publish_head(Arc::new(next));
        }
        cleared
    }

    /// Drop every staged future (stale candidates after a restart).
    pub(crate) fn discard_all_staged(&self) -> usize {
        let _ledger = self.ledger.lock();
        let current = self.state();
        let count = current.staged.values().map(Vec::len).sum();
        if count > 0 {
            let mut next = (*current).clone();
            next.staged.clear();
            self.publish_head(Arc::new(next));
        }
        count
    }

    /// Check that `candidate` could commit `rows` against the current head.
    pub(crate) fn ensure_current(&self, candidate: CandidateId, rows: &[NodeKey]) -> Result<(), StoreError> {
        let held: Vec<NodeKey> = {
            let intents = self.intents.lock();
            rows.iter().filter(|k| intents.contains(*k)).cloned().collect()
        };
        if !held.is_empty() {
            return Err(StoreError::conflict(held));
        }
        pending_changes(&self.state(), candidate, rows).map(|_| ())
    }

    /// Atomically flip `rows` from future to current for `candidate`.
    ///
    /// `rewrites` describe how the commit changed source files: spans in
    /// those files move with the edits, and rows enclosing an edit take
    /// their new text as part of the same version.
    ///
    /// Fails with `ConcurrentWriteConflict` when another write holds one of
    /// the rows or a row moved since the candidate staged it; nothing is
    /// written in that case.
    pub(crate) fn commit_version(
        &self,
        candidate: CandidateId,
        rows: &[NodeKey],
        summary: &str,
        rewrites: &[FileRewrite],
    ) -> Result<GraphVersion, StoreError> {
        let mut keys = rows.to_vec();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Err(StoreError::Inconsistent("commit names no rows".to_string()));
        }

        let _intent = self.claim(&keys)?;
        let mut ledger = self.ledger.lock();
        let current = self.state();
        let changes = pending_changes(&current, candidate, &keys)?;

        let number = ledger.next_version;
        let now = Utc::now();
        let mut next = (*current).clone();
        let mut revisions = Vec::new();
        let mut edges_changed = false;

        for change in changes {
            let key = change.key.clone();
            if let Some(futures) = next.staged.get_mut(&key) {
                futures.retain(|f| f.candidate != candidate);
                if futures.is_empty() {
                    next.staged.remove(&key);
                }
            }

            match change.action {
                FutureAction::Create | FutureAction::Edit => {
                    let live = current.rows.get(&key).map_or(0, |r| r.version);
                    let version = ledger.bump(&key, live);
                    let mut row = match current.rows.get(&key) {
                        Some(old) => (**old).clone(),
                        None => CodeGraphRow::new(key.clone(), String::new(), 0),
                    };
                    row.current_code = change.code.clone();
                    row.version = version;
                    row.validation_status = change.status;
                    row.candidate_diff_id = Some(candidate);
                    row.updated_at = now;
                    next.rows.insert(key.clone(), Arc::new(row));

                    if let Some(node) = next.nodes.get(&key) {
                        let mut node = (**node).clone();
                        node.body_hash = body_hash(&change.code);
                        next.insert_node(node);
                    }

                    revisions.push(revision(&key, version, number, Some(change.code), change.action, candidate, now));
                }
                FutureAction::Delete => {
                    edges_changed = true;
                    let mut removed = next.remove_subtree(&key);
                    if !removed.contains(&key) {
                        removed.push(key.clone());
                    }
                    for gone in removed {
                        next.staged.remove(&gone);
                        if let Some(old) = next.rows.remove(&gone) {
                            let version = ledger.bump(&gone, old.version);
                            revisions.push(revision(&gone, version, number, None, FutureAction::Delete, candidate, now));
                        }
                    }
                }
                FutureAction::None => {}
            }
        }

        if edges_changed {
            next.rebuild_adjacency();
        }

        let mut refreshed = Vec::new();
        for rewrite in rewrites {
            let spanned: Vec<Arc<InterfaceNode>> = next
                .nodes
                .values()
                .filter(|n| n.span.as_ref().is_some_and(|s| s.file == rewrite.file))
                .cloned()
                .collect();
            for node in spanned {
                let Some(old_span) = &node.span else {
                    continue;
                };
                let mut moved = (*node).clone();
                moved.span = rewrite.relocate(&node.key, old_span);

                let enclosing = rewrite.encloses_edit(&node.key, old_span) && !keys.contains(&node.key);
                if let (true, Some(span), Some(row)) = (enclosing, moved.span.clone(), next.rows.get(&node.key).cloned()) {
                    let text = rewrite.text(&span);
                    if text != row.current_code {
                        let version = ledger.bump(&node.key, row.version);
                        let mut row = (*row).clone();
                        row.current_code = text.clone();
                        row.version = version;
                        row.updated_at = now;
                        moved.body_hash = body_hash(&text);
                        revisions.push(revision(&node.key, version, number, Some(text), FutureAction::Edit, candidate, now));
                        next.rows.insert(node.key.clone(), Arc::new(row));
                        refreshed.push(node.key.clone());
                    }
                }
                if moved != *node {
                    next.insert_node(moved);
                }
            }
        }
        if !refreshed.is_empty() {
            debug!(rows = refreshed.len(), "Refreshed enclosing rows");
        }
        next.version = number;

        let mut rows = keys;
        rows.extend(refreshed);
        rows.sort();
        rows.dedup();

        let version = GraphVersion {
            number,
            parent: parent_of(current.version),
            created_at: now,
            summary: summary.to_string(),
            rollback_available: true,
            rows,
        };

        let next = Arc::new(next);
        ledger.append(revisions);
        ledger.publish(version.clone(), Arc::clone(&next));
        self.publish_head(next);

        info!(version = number, candidate = %candidate, rows = version.rows.len(), "Committed version");
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Version management
    // ------------------------------------------------------------------

    /// Move the head back to a retained version.
    ///
    /// Rows whose code differs from the target get a fresh row version, so
    /// row versions stay monotonic. No version record is created.
    pub fn rollback_to(&self, target: u64) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock();
        let current = self.state();
        let Some(snapshot) = rollback_target(&ledger, &current, target)? else {
            return Ok(());
        };

        let now = Utc::now();
        let mut next = (*snapshot).clone();
        next.staged.clear();
        let mut revisions = Vec::new();

        let keys: BTreeSet<NodeKey> = current
            .rows
            .keys()
            .chain(snapshot.rows.keys())
            .cloned()
            .collect();
        for key in keys {
            match (current.rows.get(&key), snapshot.rows.get(&key)) {
                (Some(live), Some(old)) if live.current_code == old.current_code => {
                    next.rows.insert(key, Arc::clone(live));
                }
                (live, Some(old)) => {
                    let version = ledger.bump(&key, live.map_or(0, |r| r.version));
                    let mut row = (**old).clone();
                    row.version = version;
                    row.updated_at = now;
                    revisions.push(rollback_revision(&key, version, target, Some(row.current_code.clone()), now));
                    next.rows.insert(key, Arc::new(row));
                }
                (Some(live), None) => {
                    let version = ledger.bump(&key, live.version);
                    revisions.push(rollback_revision(&key, version, target, None, now));
                }
                (None, None) => {}
            }
        }

        ledger.append(revisions);
        self.publish_head(Arc::new(next));
        info!(from = current.version, to = target, "Rolled back graph");
        Ok(())
    }

    /// Check that the head could move back to `target` now.
    pub fn ensure_rollback(&self, target: u64) -> Result<(), StoreError> {
        let ledger = self.ledger.lock();
        rollback_target(&ledger, &self.state(), target).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture the full logical state.
    pub fn snapshot(&self) -> GraphSnapshot {
        let ledger = self.ledger.lock();
        let state = self.state();
        GraphSnapshot {
            head: state.version,
            nodes: state.nodes.values().map(|n| (**n).clone()).collect(),
            edges: state.edges.iter().cloned().collect(),
            rows: state.rows.values().map(|r| (**r).clone()).collect(),
            staged: state.staged.values().flatten().cloned().collect(),
            versions: ledger.versions.clone(),
            history: ledger.history.values().flatten().cloned().collect(),
        }
    }

    /// Rebuild a store from a snapshot. Only the head state is retained, so
    /// rolling back to earlier versions is unavailable afterwards.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, StoreError> {
        let mut state = GraphState {
            version: snapshot.head,
            ..Default::default()
        };
        for node in snapshot.nodes {
            if state.nodes.contains_key(&node.key) {
                return Err(StoreError::KeyCollision {
                    key: node.key,
                    reason: "snapshot carries the key twice".to_string(),
                });
            }
            state.insert_node(node);
        }
        state.edges = snapshot.edges.into_iter().collect();
        state.rebuild_adjacency();
        state.check_integrity()?;

        for row in snapshot.rows {
            state.rows.insert(row.key.clone(), Arc::new(row));
        }
        let mut staged = snapshot.staged;
        staged.sort_by_key(|f| f.staged_at);
        for future in staged {
            state.staged.entry(future.key.clone()).or_default().push(future);
        }

        if snapshot.head != 0 && !snapshot.versions.iter().any(|v| v.number == snapshot.head) {
            return Err(StoreError::UnknownVersion(snapshot.head));
        }

        let mut ledger = Ledger::genesis();
        for row in state.rows.values() {
            ledger.row_high_water.insert(row.key.clone(), row.version);
        }
        for revision in &snapshot.history {
            let hw = ledger.row_high_water.entry(revision.key.clone()).or_insert(0);
            *hw = (*hw).max(revision.version);
        }
        ledger.append(snapshot.history);
        ledger.next_version = snapshot
            .versions
            .iter()
            .map(|v| v.number)
            .max()
            .unwrap_or(0)
            .max(snapshot.head)
            + 1;
        ledger.versions = snapshot.versions;
        if snapshot.head != 0 {
            ledger.snapshots.clear();
        }
        let state = Arc::new(state);
        ledger.snapshots.insert(snapshot.head, Arc::clone(&state));

        Ok(Self {
            head: RwLock::new(state),
            ledger: Mutex::new(ledger),
            intents: Mutex::new(HashSet::new()),
        })
    }
}

/// Retained state for `target`, or `None` when it already is the head.
fn rollback_target(ledger: &Ledger, current: &GraphState, target: u64) -> Result<Option<Arc<GraphState>>, StoreError> {
    if !current.staged.is_empty() {
        return Err(StoreError::conflict(current.staged.keys().cloned()));
    }
    if target == current.version {
        return Ok(None);
    }

    let record = ledger.versions.iter().find(|v| v.number == target);
    if target != 0 && record.is_none() {
        return Err(StoreError::UnknownVersion(target));
    }
    if record.is_some_and(|v| !v.rollback_available) {
        return Err(StoreError::RollbackUnavailable(target));
    }
    ledger
        .snapshots
        .get(&target)
        .cloned()
        .map(Some)
        .ok_or(StoreError::RollbackUnavailable(target))
}

/// The futures `candidate` staged on `keys`, provided no row moved since.
fn pending_changes(state: &GraphState, candidate: CandidateId, keys: &[NodeKey]) -> Result<Vec<StagedFuture>, StoreError> {
    let mut changes = Vec::with_capacity(keys.len());
    let mut moved = Vec::new();
    for key in keys {
        let future = state
            .staged
            .get(key)
            .and_then(|f| f.iter().find(|f| f.candidate == candidate))
            .ok_or_else(|| StoreError::MissingRow(key.clone()))?;
        let live = state.rows.get(key).map_or(0, |r| r.version);
        if live != future.base_version {
            moved.push(key.clone());
        } else {
            changes.push(future.clone());
        }
    }
    if !moved.is_empty() {
        return Err(StoreError::conflict(moved));
    }
    Ok(changes)
}

fn parent_of(version: u64) -> Option<u64> {
    (version != 0).then_some(version)
}

fn revision(
    key: &NodeKey,
    version: u64,
    graph_version: u64,
    code: Option<String>,
    action: FutureAction,
    candidate: CandidateId,
    at: DateTime<Utc>,
) -> RowRevision {
    RowRevision {
        key: key.clone(),
        version,
        graph_version,
        code,
        action,
        candidate: Some(candidate),
        reason: RevisionReason::Commit,
        recorded_at: at,
    }
}

fn rollback_revision(
    key: &NodeKey,
    version: u64,
    graph_version: u64,
    code: Option<String>,
    at: DateTime<Utc>,
) -> RowRevision {
    RowRevision {
        key: key.clone(),
        version,
        graph_version,
        code,
        action: FutureAction::None,
        candidate: None,
        reason: RevisionReason::Rollback,
        recorded_at: at,
    }
}
