//! Brute-force cosine search over node embeddings.

use std::cmp::Ordering;

use super::models::{InterfaceNode, LevelFilter, NodeRef};

/// Largest possible cosine distance.
pub const MAX_DISTANCE: f32 = 2.0;

/// Cosine distance `1 - cos(a, b)`, in `[0, 2]`.
///
/// Vectors of different length or with zero norm are orthogonal to everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
    (1.0 - cos).clamp(0.0, MAX_DISTANCE)
}

/// The `k` nearest nodes to `query`, ordered by (distance, key).
pub(crate) fn nearest<'a>(
    nodes: impl Iterator<Item = &'a InterfaceNode>,
    query: &[f32],
    k: usize,
    level_filter: LevelFilter,
) -> Vec<(NodeRef, f32)> {
    if k == 0 || query.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<(NodeRef, f32)> = nodes
        .filter(|n| level_filter.allows(n.level))
        .filter_map(|n| {
            n.embedding
                .as_ref()
                .map(|e| (NodeRef::of(n), cosine_distance(query, e)))
        })
        .collect();

    hits.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.key.cmp(&b.0.key))
    });
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::models::{Level, NodeKind};

    fn node(key: &str, level: Level, embedding: Vec<f32>) -> InterfaceNode {
        let mut n = InterfaceNode::new(key, NodeKind::Function, key);
        n.level = level;
        n.embedding = Some(embedding);
        n
    }

    #[test]
    fn test_cosine_distance_bounds() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_nearest_orders_and_filters() {
        let nodes = vec![
            node("b", Level::L1, vec![1.0, 0.1]),
            node("a", Level::L1, vec![1.0, 0.1]),
            node("c", Level::L1, vec![0.0, 1.0]),
            node("d", Level::L2, vec![1.0, 0.0]),
        ];
        let hits = nearest(nodes.iter(), &[1.0, 0.0], 2, LevelFilter::Primary);
        let keys: Vec<&str> = hits.iter().map(|(r, _)| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let any = nearest(nodes.iter(), &[1.0, 0.0], 1, LevelFilter::Any);
        assert_eq!(any[0].0.key.as_str(), "d");
    }
}
