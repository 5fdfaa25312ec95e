//! Bounded breadth-first traversal over the adjacency lists.
//!
//! The graph may contain cycles (`A calls B calls A`), so every walk keeps a
//! visited set. Traversals are undirected: both callers and callees of a
//! node belong to its neighbourhood.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::models::{EdgeFilter, EdgeKind, NodeKey, NodeRef};
use super::store::GraphState;

/// Walk up to `max_hops` hops from `seeds`, keeping at most `max_per_hop`
/// newly reached nodes per hop.
///
/// A node reached by several paths keeps the smallest hop count; among paths
/// of equal length the edge kind with the best priority wins. Nodes dropped
/// by the per-hop cap are ordered after kept ones by (edge priority, key).
/// Seeds are not part of the result.
pub(crate) fn traverse(
    state: &GraphState,
    seeds: &[NodeKey],
    filter: &EdgeFilter,
    max_per_hop: usize,
    max_hops: u8,
) -> Vec<NodeRef> {
    let mut visited: HashSet<&NodeKey> = seeds
        .iter()
        .filter(|k| state.nodes.contains_key(*k))
        .collect();
    let mut frontier: Vec<&NodeKey> = visited.iter().copied().collect();
    frontier.sort();

    let mut reached = Vec::new();

    for hop in 1..=max_hops {
        if frontier.is_empty() {
            break;
        }

        let mut found: BTreeMap<&NodeKey, EdgeKind> = BTreeMap::new();
        for key in &frontier {
            for (neighbour, kind) in state.neighbours(key) {
                if !filter.allows(*kind) || visited.contains(neighbour) {
                    continue;
                }
                found
                    .entry(neighbour)
                    .and_modify(|best| {
                        if kind.priority() < best.priority() {
                            *best = *kind;
                        }
                    })
                    .or_insert(*kind);
            }
        }

        let mut ranked: Vec<(&NodeKey, EdgeKind)> = found.into_iter().collect();
        ranked.sort_by(|a, b| {
            a.1.priority()
                .cmp(&b.1.priority())
                .then_with(|| a.0.cmp(b.0))
        });
        ranked.truncate(max_per_hop);

        frontier = Vec::with_capacity(ranked.len());
        for (key, via) in ranked {
            if let Some(node) = state.nodes.get(key) {
                visited.insert(key);
                frontier.push(key);
                reached.push(NodeRef {
                    hops: Some(hop),
                    via: Some(via),
                    ..NodeRef::of(node)
                });
            }
        }
        frontier.sort();
    }

    reached
}

/// Every node with a directed path *into* one of `keys`, i.e. everything that
/// transitively depends on them. Unbounded; `keys` are excluded.
pub(crate) fn dependents_closure(state: &GraphState, keys: &[NodeKey]) -> BTreeSet<NodeKey> {
    let mut visited: HashSet<&NodeKey> = keys.iter().collect();
    let mut queue: VecDeque<&NodeKey> = keys.iter().collect();
    let mut result = BTreeSet::new();

    while let Some(key) = queue.pop_front() {
        let Some(incoming) = state.incoming.get(key) else {
            continue;
        };
        for (source, _) in incoming {
            if visited.insert(source) {
                result.insert(source.clone());
                queue.push_back(source);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::models::{Edge, InterfaceNode, NodeKind};

    fn state(keys: &[&str], edges: &[(&str, &str, EdgeKind)]) -> GraphState {
        let mut state = GraphState::default();
        for key in keys {
            state.insert_node(InterfaceNode::new(*key, NodeKind::Function, *key));
        }
        for (from, to, kind) in edges {
            state.edges.insert(Edge::new(*from, *to, *kind));
        }
        state.rebuild_adjacency();
        state
    }

    fn keys(refs: &[NodeRef]) -> Vec<&str> {
        refs.iter().map(|r| r.key.as_str()).collect()
    }

    #[test]
    fn test_chain_is_undirected() {
        let s = state(
            &["a", "b", "c"],
            &[("a", "b", EdgeKind::Calls), ("b", "c", EdgeKind::Calls)],
        );
        let reached = traverse(&s, &["b".into()], &EdgeFilter::All, 30, 2);
        assert_eq!(keys(&reached), vec!["a", "c"]);
        assert!(reached.iter().all(|r| r.hops == Some(1)));
    }

    #[test]
    fn test_cycle_terminates() {
        let s = state(
            &["a", "b"],
            &[("a", "b", EdgeKind::Calls), ("b", "a", EdgeKind::Calls)],
        );
        let reached = traverse(&s, &["a".into()], &EdgeFilter::All, 30, 2);
        assert_eq!(keys(&reached), vec!["b"]);
    }

    #[test]
    fn test_tie_break_prefers_calls() {
        let s = state(
            &["a", "b"],
            &[("a", "b", EdgeKind::Uses), ("a", "b", EdgeKind::Calls)],
        );
        let reached = traverse(&s, &["a".into()], &EdgeFilter::All, 30, 2);
        assert_eq!(reached[0].via, Some(EdgeKind::Calls));
    }

    #[test]
    fn test_shortest_hop_wins() {
        let s = state(
            &["a", "b", "c"],
            &[
                ("a", "b", EdgeKind::Calls),
                ("b", "c", EdgeKind::Calls),
                ("a", "c", EdgeKind::FeatureGatedBy),
            ],
        );
        let reached = traverse(&s, &["a".into()], &EdgeFilter::All, 30, 2);
        let c = reached.iter().find(|r| r.key.as_str() == "c").unwrap();
        assert_eq!(c.hops, Some(1));
        assert_eq!(reached.len(), 2);
    }

    #[test]
    fn test_per_hop_cap() {
        let s = state(
            &["root", "x1", "x2", "x3"],
            &[
                ("root", "x3", EdgeKind::Calls),
                ("root", "x2", EdgeKind::Uses),
                ("root", "x1", EdgeKind::Uses),
            ],
        );
        let reached = traverse(&s, &["root".into()], &EdgeFilter::All, 2, 1);
        assert_eq!(keys(&reached), vec!["x3", "x1"]);
    }

    #[test]
    fn test_filter_and_dependents() {
        let s = state(
            &["t", "a", "b", "c"],
            &[
                ("t", "a", EdgeKind::Calls),
                ("a", "b", EdgeKind::Calls),
                ("b", "c", EdgeKind::Calls),
            ],
        );
        let only_uses = traverse(&s, &["b".into()], &EdgeFilter::only([EdgeKind::Uses]), 30, 2);
        assert!(only_uses.is_empty());

        let closure = dependents_closure(&s, &["b".into()]);
        let closure: Vec<&str> = closure.iter().map(|k| k.as_str()).collect();
        assert_eq!(closure, vec!["a", "t"]);
    }
}
