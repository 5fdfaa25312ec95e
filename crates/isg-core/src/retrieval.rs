//! Hybrid retrieval engine.
//!
//! Turns seed keys and free-text hints into a ranked, budget-capped
//! shortlist. Bounded graph traversal from the seeds and vector search over
//! an embedding of (seed summaries + hints) run concurrently; their results
//! are merged by key and ranked by
//!
//! `rank = w_level·level + w_graph·(1 − hops/max_hops) + w_vector·(1 − d/2) + w_pattern·pattern`
//!
//! Level is a hard tier: every Level-1 item sorts before any Level-2/3 item.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::{ConfigError, RetrievalConfig, DEFAULT_MAX_HOPS, DEFAULT_TOKEN_BUDGET};
use crate::embedder::{EmbedError, Embedder};
use crate::graph::vector::MAX_DISTANCE;
use crate::graph::{EdgeFilter, GraphState, GraphStore, InterfaceNode, Level, LevelFilter, NodeKey, NodeRef};
use crate::patterns::PatternLibrary;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to embed query: {0}")]
    Embedding(#[from] EmbedError),

    /// A traversal or search task panicked or was cancelled.
    #[error("Retrieval task failed: {0}")]
    Task(String),
}

/// Token estimate a shortlist may not exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct TokenBudget(usize);

impl TokenBudget {
    pub fn new(tokens: i64) -> Result<Self, ConfigError> {
        if tokens <= 0 {
            return Err(ConfigError::Invalid(format!(
                "token budget must be positive, got {tokens}"
            )));
        }
        Ok(Self(tokens as usize))
    }

    pub fn tokens(&self) -> usize {
        self.0
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self(DEFAULT_TOKEN_BUDGET)
    }
}

impl TryFrom<i64> for TokenBudget {
    type Error = ConfigError;

    fn try_from(tokens: i64) -> Result<Self, Self::Error> {
        Self::new(tokens)
    }
}

impl From<TokenBudget> for i64 {
    fn from(budget: TokenBudget) -> Self {
        budget.0 as i64
    }
}

/// Query from an external reasoner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub seed_keys: Vec<NodeKey>,
    #[serde(default)]
    pub hints: Vec<String>,
    /// Falls back to the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<i64>,
}

/// One ranked context item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortlistItem {
    pub node_key: NodeKey,
    pub summary: String,
    pub rank: f32,
    pub level: Level,
}

/// Ranked, size-bounded context set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shortlist {
    pub items: Vec<ShortlistItem>,
    /// Estimated tokens of the returned items.
    pub estimated_tokens: usize,
    /// Whether ranked items were dropped by the item cap or the budget.
    pub truncated: bool,
}

impl Shortlist {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        self.items.iter().map(|i| i.node_key.clone()).collect()
    }
}

/// Graph and vector signals gathered for one key.
#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    hops: Option<u8>,
    distance: Option<f32>,
}

/// Hybrid retrieval over the graph store and the pattern library.
pub struct HybridRetriever {
    store: Arc<GraphStore>,
    patterns: Arc<PatternLibrary>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<GraphStore>,
        patterns: Arc<PatternLibrary>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            patterns,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Build the shortlist for `seeds` and `hints`.
    ///
    /// An empty seed set with no hints yields an empty shortlist.
    #[instrument(skip(self, seeds, hints), fields(seeds = seeds.len(), hints = hints.len()))]
    pub async fn retrieve(
        &self,
        seeds: Vec<NodeKey>,
        hints: Vec<String>,
        budget: TokenBudget,
    ) -> Result<Shortlist, RetrievalError> {
        let hints: Vec<String> = hints
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if seeds.is_empty() && hints.is_empty() {
            return Ok(Shortlist::default());
        }

        let state = self.store.state();
        let mut query: Vec<String> = seeds
            .iter()
            .filter_map(|k| state.nodes.get(k))
            .map(|n| n.summary())
            .collect();
        query.extend(hints);
        let query = query.join("\n");

        let traversal = {
            let store = Arc::clone(&self.store);
            let seeds = seeds.clone();
            let max_per_hop = self.config.max_per_hop;
            tokio::task::spawn_blocking(move || store.two_hop(&seeds, &EdgeFilter::All, max_per_hop))
        };
        let (reached, similar) = tokio::join!(traversal, self.similar(query));
        let reached = reached.map_err(|e| RetrievalError::Task(e.to_string()))?;
        let similar = similar?;

        let mut merged: BTreeMap<NodeKey, Signals> = BTreeMap::new();
        for key in seeds.iter().filter(|k| state.nodes.contains_key(*k)) {
            merged.entry(key.clone()).or_default().hops = Some(0);
        }
        for NodeRef { key, hops, .. } in reached {
            let signals = merged.entry(key).or_default();
            signals.hops = match (signals.hops, hops) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        for (node, distance) in similar {
            merged.entry(node.key).or_default().distance = Some(distance);
        }

        let shortlist = self.rank(&state, &merged, budget);
        debug!(
            candidates = merged.len(),
            items = shortlist.len(),
            tokens = shortlist.estimated_tokens,
            "Built shortlist"
        );
        Ok(shortlist)
    }

    async fn similar(&self, query: String) -> Result<Vec<(NodeRef, f32)>, RetrievalError> {
        if query.is_empty() || self.config.vector_k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_one(&query).await?;
        let store = Arc::clone(&self.store);
        let k = self.config.vector_k;
        tokio::task::spawn_blocking(move || store.vector_search(&vector, k, LevelFilter::Any))
            .await
            .map_err(|e| RetrievalError::Task(e.to_string()))
    }

    fn rank(&self, state: &GraphState, merged: &BTreeMap<NodeKey, Signals>, budget: TokenBudget) -> Shortlist {
        let w = &self.config.weights;
        let max_hops = f32::from(DEFAULT_MAX_HOPS);

        let mut ranked: Vec<(&InterfaceNode, f32)> = merged
            .iter()
            .filter_map(|(key, signals)| state.nodes.get(key).map(|n| (n.as_ref(), *signals)))
            .filter(|(node, _)| {
                node.level == Level::L1
                    || l1_ancestor(state, node).is_some_and(|a| merged.contains_key(a))
            })
            .map(|(node, signals)| {
                let graph = signals
                    .hops
                    .map_or(0.0, |h| 1.0 - (f32::from(h) / max_hops).min(1.0));
                let vector = signals
                    .distance
                    .map_or(0.0, |d| 1.0 - (d / MAX_DISTANCE).clamp(0.0, 1.0));
                let pattern = node
                    .embedding
                    .as_deref()
                    .map_or(0.0, |e| self.pattern_relevance(e));
                let rank = w.level * node.level.priority()
                    + w.graph * graph
                    + w.vector * vector
                    + w.pattern * pattern;
                (node, rank)
            })
            .collect();

        ranked.sort_by(|(a, ra), (b, rb)| {
            a.level
                .cmp(&b.level)
                .then_with(|| rb.total_cmp(ra))
                .then_with(|| a.key.cmp(&b.key))
        });

        let chars_per_token = self.config.chars_per_token.max(1);
        let mut shortlist = Shortlist::default();
        for (node, rank) in ranked {
            if shortlist.items.len() >= self.config.max_items {
                shortlist.truncated = true;
                break;
            }
            let summary = node.summary();
            let code_len = state.rows.get(&node.key).map_or(0, |r| r.current_code.len());
            let cost = (summary.len() + code_len).div_ceil(chars_per_token);
            if shortlist.estimated_tokens + cost > budget.tokens() {
                shortlist.truncated = true;
                break;
            }
            shortlist.estimated_tokens += cost;
            shortlist.items.push(ShortlistItem {
                node_key: node.key.clone(),
                summary,
                rank,
                level: node.level,
            });
        }
        shortlist
    }

    /// Best of `(1 − d/2)·(0.5 + 0.5·success_rate)` over the nearest patterns.
    fn pattern_relevance(&self, embedding: &[f32]) -> f32 {
        self.patterns
            .nearest_patterns(embedding, self.config.pattern_k)
            .iter()
            .map(|(p, d)| {
                let closeness = 1.0 - (d / MAX_DISTANCE).clamp(0.0, 1.0);
                closeness * (0.5 + 0.5 * p.stats.success_rate.clamp(0.0, 1.0))
            })
            .fold(0.0, f32::max)
    }
}

/// The Level-1 node a nested node hangs off.
fn l1_ancestor<'a>(state: &'a GraphState, node: &'a InterfaceNode) -> Option<&'a NodeKey> {
    let mut current = node;
    while current.level != Level::L1 {
        current = state.nodes.get(current.parent.as_ref()?)?;
    }
    Some(&current.key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use crate::embedder::HashEmbedder;
    use crate::graph::{Edge, EdgeKind, IngestBatch, IngestNode, NodeKind};
    use crate::ingest::embed_missing;
    use crate::patterns::seed_library;

    fn f(key: &str, doc: &str) -> IngestNode {
        IngestNode::new(
            InterfaceNode::new(key, NodeKind::Function, format!("fn {key}()")).with_doc(doc),
            format!("fn {key}() {{}}"),
        )
    }

    async fn retriever(config: RetrievalConfig) -> HybridRetriever {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let store = Arc::new(GraphStore::new());
        let mut batch = IngestBatch {
            nodes: vec![
                f("a", "parse the request header"),
                f("b", "validate the parsed header"),
                f("c", "write the response body"),
                f("d", "unrelated cache eviction"),
                IngestNode::new(
                    InterfaceNode::new("b::arg", NodeKind::Field, "arg: Header")
                        .nested("b", Level::L2)
                        .with_doc("header argument"),
                    "arg: Header",
                ),
            ],
            edges: vec![
                Edge::new("a", "b", EdgeKind::Calls),
                Edge::new("b", "c", EdgeKind::Calls),
            ],
        };
        embed_missing(&mut batch, &store, embedder.as_ref()).await.unwrap();
        store.upsert_nodes(batch.nodes, batch.edges).unwrap();

        let patterns = PatternLibrary::load(seed_library().unwrap(), embedder.as_ref(), &PatternConfig::default())
            .await
            .unwrap();
        HybridRetriever::new(store, Arc::new(patterns), embedder, config)
    }

    #[tokio::test]
    async fn test_empty_request_is_empty() {
        let r = retriever(RetrievalConfig::default()).await;
        let shortlist = r
            .retrieve(vec![], vec!["  ".to_string()], TokenBudget::default())
            .await
            .unwrap();
        assert!(shortlist.is_empty());
        assert!(!shortlist.truncated);
    }

    #[test]
    fn test_budget_rejects_non_positive() {
        assert!(TokenBudget::new(0).is_err());
        assert!(TokenBudget::new(-5).is_err());
        assert_eq!(TokenBudget::new(12).unwrap().tokens(), 12);
        assert!(serde_json::from_str::<TokenBudget>("-1").is_err());
    }

    #[tokio::test]
    async fn test_seed_neighbourhood_ranks_levels_first() {
        let r = retriever(RetrievalConfig::default()).await;
        let shortlist = r
            .retrieve(vec![NodeKey::from("b")], vec![], TokenBudget::default())
            .await
            .unwrap();

        let keys = shortlist.keys();
        assert_eq!(keys.first(), Some(&NodeKey::from("b")));
        assert!(keys.contains(&NodeKey::from("a")));
        assert!(keys.contains(&NodeKey::from("c")));

        let first_nested = shortlist.items.iter().position(|i| i.level != Level::L1);
        let last_primary = shortlist.items.iter().rposition(|i| i.level == Level::L1);
        if let (Some(nested), Some(primary)) = (first_nested, last_primary) {
            assert!(primary < nested);
        }
        assert!(shortlist.items.iter().any(|i| i.node_key.as_str() == "b::arg"));
    }

    #[tokio::test]
    async fn test_budget_and_item_cap_truncate() {
        let r = retriever(RetrievalConfig::default()).await;
        let tiny = r
            .retrieve(vec![NodeKey::from("b")], vec![], TokenBudget::new(1).unwrap())
            .await
            .unwrap();
        assert!(tiny.is_empty());
        assert!(tiny.truncated);

        let capped = retriever(RetrievalConfig {
            max_items: 2,
            ..Default::default()
        })
        .await
        .retrieve(vec![NodeKey::from("b")], vec![], TokenBudget::default())
        .await
        .unwrap();
        assert_eq!(capped.len(), 2);
        assert!(capped.truncated);
        assert!(capped.items.iter().all(|i| i.level == Level::L1));
    }

    #[tokio::test]
    async fn test_nested_item_needs_its_ancestor() {
        let r = retriever(RetrievalConfig {
            vector_k: 1,
            ..Default::default()
        })
        .await;
        let shortlist = r
            .retrieve(vec![], vec!["field arg: Header: header argument".to_string()], TokenBudget::default())
            .await
            .unwrap();
        assert!(shortlist.items.iter().all(|i| i.level == Level::L1));
    }

    #[tokio::test]
    async fn test_retrieval_is_deterministic() {
        let r = retriever(RetrievalConfig::default()).await;
        let hints = vec!["parse header".to_string()];
        let first = r
            .retrieve(vec![NodeKey::from("a")], hints.clone(), TokenBudget::default())
            .await
            .unwrap();
        let second = r
            .retrieve(vec![NodeKey::from("a")], hints, TokenBudget::default())
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
