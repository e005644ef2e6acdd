//! Embedding-space loss between two execution traces.

use crate::{BlockTrace, TraceGraph};

/// Cosine similarity of two vectors, zero-padding the shorter one. Returns
/// 0.0 when either magnitude is zero.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().max(b.len());
    let mut dot = 0.0;
    let mut mag_a = 0.0;
    let mut mag_b = 0.0;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0.0);
        let y = b.get(i).copied().unwrap_or(0.0);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b).sqrt()
}

/// Loss in `[0, 1]`, higher when the two traces are more alike in embedding
/// space. Absorbs both traces and retrains embeddings first, so the graph
/// reflects them before their mean embeddings are compared.
pub fn embedding_loss(graph: &TraceGraph, forbidden: &BlockTrace, current: &BlockTrace) -> f64 {
    assert!(!current.is_empty(), "embedding_loss: current trace cannot be empty");
    assert!(
        !forbidden.is_empty(),
        "embedding_loss: forbidden trace cannot be empty"
    );

    graph.absorb_trace(current);
    graph.absorb_trace(forbidden);
    graph.train_embeddings();

    let mean_current = graph.mean_embedding(current);
    let mean_forbidden = graph.mean_embedding(forbidden);

    // cosine is in [-1, 1]; map similar -> 1.0, opposite -> 0.0.
    (cosine_similarity(&mean_current, &mean_forbidden) + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Node2VecParams, DEFAULT_EMBEDDING_DIM};

    #[test]
    fn cosine_stays_in_bounds() {
        let cases: &[(&[f64], &[f64])] = &[
            (&[1.0, 0.0], &[1.0, 0.0]),
            (&[1.0, 0.0], &[-1.0, 0.0]),
            (&[1.0, 2.0, 3.0], &[0.5]),
            (&[1e9, -1e9], &[1e-9, 1e9]),
        ];
        for (a, b) in cases {
            let sim = cosine_similarity(a, b);
            assert!((-1.0..=1.0).contains(&sim), "cosine {sim} out of bounds");
        }
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
    }

    #[test]
    fn loss_of_a_trace_against_itself_is_one() {
        let graph = TraceGraph::new(DEFAULT_EMBEDDING_DIM, Node2VecParams::default());
        let trace = vec![0x10, 0x20, 0x30, 0x10];
        let loss = embedding_loss(&graph, &trace, &trace);
        assert!((loss - 1.0).abs() < 1e-9, "loss {loss} != 1.0");
    }

    #[test]
    fn loss_stays_in_unit_interval() {
        let graph = TraceGraph::new(DEFAULT_EMBEDDING_DIM, Node2VecParams::default());
        let a = vec![1, 2, 3];
        let b = vec![9, 8, 7, 6];
        let loss = embedding_loss(&graph, &a, &b);
        assert!((0.0..=1.0).contains(&loss), "loss {loss} out of bounds");
    }
}
