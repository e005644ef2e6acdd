//! Control-flow graph learned from execution traces, with continuously
//! trained Node2Vec embeddings.
//!
//! Traces are walks over the graph: nodes are basic-block offsets, edges are
//! observed transitions. Every absorbed trace may add nodes and edges (never
//! remove them), and embeddings are retrained after each absorb so that
//! distances in embedding space track how the target's control flow relates.

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore as _, SeedableRng as _};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::BlockTrace;

/// Learned vector representation of a graph node.
pub type Embedding = Vec<f64>;

pub const DEFAULT_EMBEDDING_DIM: u32 = 4;

/// Negative samples drawn per positive skip-gram pair.
const NEGATIVE_SAMPLES: usize = 5;

/// Magnitude of the uniform noise new embeddings are initialized with.
const INIT_NOISE: f64 = 0.1;

/// Node2Vec hyperparameters, fixed for the lifetime of a graph.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Node2VecParams {
    /// Return bias: candidate weight is `1/p` when stepping back to the
    /// previous node.
    pub p: f64,
    /// In-out bias: candidate weight is `1/q` when stepping outside the
    /// previous node's neighborhood.
    pub q: f64,
    pub walk_length: u32,
    pub walks_per_node: u32,
    /// Skip-gram context window radius.
    pub window: u32,
    pub learning_rate: f64,
    /// Seed for the engine's deterministic RNG. Checkpoints do not carry RNG
    /// state; restores reseed from this value.
    pub seed: u64,
}

impl Default for Node2VecParams {
    fn default() -> Self {
        Self {
            p: 1.0,
            q: 1.0,
            walk_length: 10,
            walks_per_node: 5,
            window: 3,
            learning_rate: 0.025,
            seed: 42,
        }
    }
}

/// Lock-free copy of the full graph payload, used by crash artifacts and
/// checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSnapshot {
    pub embedding_dim: u32,
    pub params: Node2VecParams,
    pub adjacency: BTreeMap<u32, Vec<u32>>,
    pub embeddings: BTreeMap<u32, Embedding>,
    pub zero_embedding: Embedding,
}

#[derive(Debug)]
struct GraphState {
    adjacency: BTreeMap<u32, Vec<u32>>,
    embeddings: BTreeMap<u32, Embedding>,
    rng: ChaCha20Rng,
}

/// The evolving CFG model. All mutation and read paths go through the single
/// internal lock; operations are total (unknown nodes read as the zero
/// vector).
#[derive(Debug)]
pub struct TraceGraph {
    embedding_dim: u32,
    params: Node2VecParams,
    zero_embedding: Embedding,
    state: Mutex<GraphState>,
}

impl TraceGraph {
    pub fn new(embedding_dim: u32, params: Node2VecParams) -> Self {
        Self {
            embedding_dim,
            params,
            zero_embedding: vec![0.0; embedding_dim as usize],
            state: Mutex::new(GraphState {
                adjacency: BTreeMap::new(),
                embeddings: BTreeMap::new(),
                rng: rng_from_seed(params.seed),
            }),
        }
    }

    /// Rebuild a graph from a previously captured snapshot. The RNG is
    /// reseeded from the snapshot's configured seed.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        Self {
            embedding_dim: snapshot.embedding_dim,
            params: snapshot.params,
            zero_embedding: snapshot.zero_embedding,
            state: Mutex::new(GraphState {
                adjacency: snapshot.adjacency,
                embeddings: snapshot.embeddings,
                rng: rng_from_seed(snapshot.params.seed),
            }),
        }
    }

    pub fn embedding_dim(&self) -> u32 {
        self.embedding_dim
    }

    pub fn params(&self) -> &Node2VecParams {
        &self.params
    }

    /// Add every node and observed transition of `trace` to the graph. New
    /// nodes get a small-noise embedding; edges are deduplicated per source.
    pub fn absorb_trace(&self, trace: &BlockTrace) {
        let mut state = self.state.lock().expect("graph lock poisoned");
        state.absorb(self.embedding_dim, trace);
    }

    /// Retrain embeddings: biased walks from every node with at least one
    /// out-neighbor, skip-gram with negative sampling on each walk.
    pub fn train_embeddings(&self) {
        let mut state = self.state.lock().expect("graph lock poisoned");
        state.train(self.embedding_dim, &self.params);
    }

    /// Mean embedding over the nodes of `trace`. Nodes without an embedding
    /// contribute nothing; the divisor is the trace length.
    pub fn mean_embedding(&self, trace: &BlockTrace) -> Embedding {
        assert!(!trace.is_empty(), "mean_embedding: trace cannot be empty");
        let state = self.state.lock().expect("graph lock poisoned");
        let dim = self.embedding_dim as usize;
        let mut mean = vec![0.0; dim];
        for node in trace {
            if let Some(emb) = state.embeddings.get(node) {
                for d in 0..dim {
                    mean[d] += emb[d];
                }
            }
        }
        for v in &mut mean {
            *v /= trace.len() as f64;
        }
        mean
    }

    /// Embedding of `node`, or the zero vector when unknown.
    pub fn node_embedding(&self, node: u32) -> Embedding {
        let state = self.state.lock().expect("graph lock poisoned");
        state
            .embeddings
            .get(&node)
            .cloned()
            .unwrap_or_else(|| self.zero_embedding.clone())
    }

    /// Euclidean distance between two nodes in embedding space.
    pub fn node_distance(&self, a: u32, b: u32) -> f64 {
        let (ea, eb) = {
            let state = self.state.lock().expect("graph lock poisoned");
            (
                state
                    .embeddings
                    .get(&a)
                    .cloned()
                    .unwrap_or_else(|| self.zero_embedding.clone()),
                state
                    .embeddings
                    .get(&b)
                    .cloned()
                    .unwrap_or_else(|| self.zero_embedding.clone()),
            )
        };
        embedding_distance(&ea, &eb)
    }

    /// Euclidean distance between `node` and the origin of embedding space.
    pub fn node_distance_to_origin(&self, node: u32) -> f64 {
        embedding_distance(&self.node_embedding(node), &self.zero_embedding)
    }

    pub fn node_count(&self) -> usize {
        let state = self.state.lock().expect("graph lock poisoned");
        state.adjacency.len()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.state.lock().expect("graph lock poisoned");
        GraphSnapshot {
            embedding_dim: self.embedding_dim,
            params: self.params,
            adjacency: state.adjacency.clone(),
            embeddings: state.embeddings.clone(),
            zero_embedding: self.zero_embedding.clone(),
        }
    }
}

impl GraphState {
    fn absorb(&mut self, dim: u32, trace: &BlockTrace) {
        for (i, &node) in trace.iter().enumerate() {
            self.adjacency.entry(node).or_default();

            if !self.embeddings.contains_key(&node) {
                let mut emb = Vec::with_capacity(dim as usize);
                for _ in 0..dim {
                    emb.push(self.next_f64() * (2.0 * INIT_NOISE) - INIT_NOISE);
                }
                self.embeddings.insert(node, emb);
            }

            if let Some(&next) = trace.get(i + 1) {
                let neighbors = self.adjacency.entry(node).or_default();
                if !neighbors.contains(&next) {
                    neighbors.push(next);
                }
            }
        }
    }

    fn train(&mut self, dim: u32, params: &Node2VecParams) {
        if self.adjacency.is_empty() || self.embeddings.is_empty() {
            return;
        }

        let starts: Vec<u32> = self
            .adjacency
            .iter()
            .filter(|(_, neighbors)| !neighbors.is_empty())
            .map(|(&node, _)| node)
            .collect();

        for _ in 0..params.walks_per_node {
            for &start in &starts {
                let walk = self.biased_walk(start, params);
                if walk.len() >= 2 {
                    self.skip_gram(dim, params, &walk);
                }
            }
        }
    }

    /// Node2Vec second-order biased walk. The first step is uniform over the
    /// start node's neighbors; later steps weight candidates by the
    /// return/in-cluster/explore rule and sample by inverse CDF.
    fn biased_walk(&mut self, start: u32, params: &Node2VecParams) -> Vec<u32> {
        let mut walk = Vec::with_capacity(params.walk_length as usize);

        match self.adjacency.get(&start) {
            Some(neighbors) if !neighbors.is_empty() => {}
            _ => return walk,
        }

        walk.push(start);
        if params.walk_length == 1 {
            return walk;
        }

        let neighbors = self.adjacency[&start].clone();
        let mut prev = start;
        let mut current = neighbors[(self.rng.next_u64() as usize) % neighbors.len()];
        walk.push(current);

        for _ in 2..params.walk_length {
            let candidates = match self.adjacency.get(&current) {
                Some(c) if !c.is_empty() => c.clone(),
                _ => break,
            };

            let mut weights: Vec<f64> = candidates
                .iter()
                .map(|&next| self.transition_weight(prev, next, params))
                .collect();
            let sum: f64 = weights.iter().sum();
            if sum > 0.0 {
                for w in &mut weights {
                    *w /= sum;
                }
            } else {
                let uniform = 1.0 / candidates.len() as f64;
                for w in &mut weights {
                    *w = uniform;
                }
            }

            let draw = self.next_f64();
            let mut cumulative = 0.0;
            let mut next = candidates[0];
            for (j, &candidate) in candidates.iter().enumerate() {
                cumulative += weights[j];
                if draw <= cumulative {
                    next = candidate;
                    break;
                }
            }

            prev = current;
            current = next;
            walk.push(current);
        }

        walk
    }

    fn transition_weight(&self, prev: u32, next: u32, params: &Node2VecParams) -> f64 {
        if next == prev {
            return 1.0 / params.p;
        }
        let in_cluster = self
            .adjacency
            .get(&prev)
            .map(|neighbors| neighbors.contains(&next))
            .unwrap_or(false);
        if in_cluster {
            1.0
        } else {
            1.0 / params.q
        }
    }

    /// Skip-gram with negative sampling over one walk. Each pairwise update
    /// reads pre-update values so the result is deterministic for a given
    /// state snapshot.
    fn skip_gram(&mut self, dim: u32, params: &Node2VecParams, walk: &[u32]) {
        if walk.len() < 2 {
            return;
        }
        let dim = dim as usize;

        let walk_set: BTreeSet<u32> = walk.iter().copied().collect();
        let negatives_pool: Vec<u32> = {
            let complement: Vec<u32> = self
                .embeddings
                .keys()
                .copied()
                .filter(|n| !walk_set.contains(n))
                .collect();
            if complement.is_empty() {
                self.embeddings.keys().copied().collect()
            } else {
                complement
            }
        };

        for i in 0..walk.len() {
            let center = walk[i];
            if !self.embeddings.contains_key(&center) {
                continue;
            }

            let lo = i.saturating_sub(params.window as usize);
            let hi = (i + params.window as usize + 1).min(walk.len());
            for j in lo..hi {
                if j == i {
                    continue;
                }
                let context = walk[j];
                if !self.embeddings.contains_key(&context) {
                    continue;
                }

                let center_emb = self.embeddings[&center].clone();
                let context_emb = self.embeddings[&context].clone();
                let gradient =
                    params.learning_rate * (1.0 - sigmoid(dot(&center_emb, &context_emb)));
                {
                    let c = self.embeddings.get_mut(&center).expect("center embedding");
                    for d in 0..dim {
                        c[d] += gradient * context_emb[d];
                    }
                }
                {
                    let c = self.embeddings.get_mut(&context).expect("context embedding");
                    for d in 0..dim {
                        c[d] += gradient * center_emb[d];
                    }
                }

                for _ in 0..NEGATIVE_SAMPLES {
                    let negative =
                        negatives_pool[(self.rng.next_u64() as usize) % negatives_pool.len()];
                    if negative == center || negative == context {
                        continue;
                    }
                    let center_emb = self.embeddings[&center].clone();
                    let negative_emb = self.embeddings[&negative].clone();
                    let push = params.learning_rate * sigmoid(dot(&center_emb, &negative_emb));
                    {
                        let c = self.embeddings.get_mut(&center).expect("center embedding");
                        for d in 0..dim {
                            c[d] -= push * negative_emb[d];
                        }
                    }
                    {
                        let n = self
                            .embeddings
                            .get_mut(&negative)
                            .expect("negative embedding");
                        for d in 0..dim {
                            n[d] -= push * center_emb[d];
                        }
                    }
                }
            }
        }
    }

    fn next_f64(&mut self) -> f64 {
        // 53 random mantissa bits, uniform in [0, 1).
        (self.rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

/// Euclidean distance between two embeddings, zero-padding the shorter one.
pub fn embedding_distance(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().max(b.len());
    let mut sum = 0.0;
    for d in 0..len {
        let x = a.get(d).copied().unwrap_or(0.0);
        let y = b.get(d).copied().unwrap_or(0.0);
        let diff = y - x;
        sum += diff * diff;
    }
    sum.sqrt()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn rng_from_seed(seed: u64) -> ChaCha20Rng {
    let digest = blake3::hash(&seed.to_le_bytes());
    let mut seed32 = [0u8; 32];
    seed32.copy_from_slice(&digest.as_bytes()[..32]);
    ChaCha20Rng::from_seed(seed32)
}
