//! Binary wire codec shared by crash artifacts and knowledge checkpoints.
//!
//! Values are written in native byte order; payloads start with an
//! endianness flag that loaders verify before decoding anything else. All
//! length prefixes are u32, all floating-point values are IEEE-754 doubles.

use std::collections::BTreeMap;

use crate::{Embedding, FuzzExecution, GraphSnapshot, Node2VecParams, VeerError, VeerResult};

pub fn host_is_little_endian() -> bool {
    cfg!(target_endian = "little")
}

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

pub fn put_str(buf: &mut Vec<u8>, v: &str) {
    put_bytes(buf, v.as_bytes());
}

pub fn put_u32_list(buf: &mut Vec<u8>, v: &[u32]) {
    put_u32(buf, v.len() as u32);
    for &x in v {
        put_u32(buf, x);
    }
}

pub fn put_f64_list(buf: &mut Vec<u8>, v: &[f64]) {
    put_u32(buf, v.len() as u32);
    for &x in v {
        put_f64(buf, x);
    }
}

/// Bounds-checked reader over a wire payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize, what: &str) -> VeerResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| VeerError::Wire(format!("truncated while reading {what}")))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self, what: &str) -> VeerResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u32(&mut self, what: &str) -> VeerResult<u32> {
        let raw = self.take(4, what)?;
        Ok(u32::from_ne_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub fn i32(&mut self, what: &str) -> VeerResult<i32> {
        let raw = self.take(4, what)?;
        Ok(i32::from_ne_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub fn f64(&mut self, what: &str) -> VeerResult<f64> {
        let raw = self.take(8, what)?;
        Ok(f64::from_ne_bytes(raw.try_into().expect("8-byte slice")))
    }

    pub fn bytes(&mut self, what: &str) -> VeerResult<Vec<u8>> {
        let len = self.u32(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    pub fn string(&mut self, what: &str) -> VeerResult<String> {
        let raw = self.bytes(what)?;
        String::from_utf8(raw).map_err(|_| VeerError::Wire(format!("{what} is not valid UTF-8")))
    }

    pub fn u32_list(&mut self, what: &str) -> VeerResult<Vec<u32>> {
        let len = self.u32(what)? as usize;
        let mut out = Vec::with_capacity(len.min(self.buf.len() / 4));
        for _ in 0..len {
            out.push(self.u32(what)?);
        }
        Ok(out)
    }

    pub fn f64_list(&mut self, what: &str) -> VeerResult<Vec<f64>> {
        let len = self.u32(what)? as usize;
        let mut out = Vec::with_capacity(len.min(self.buf.len() / 8));
        for _ in 0..len {
            out.push(self.f64(what)?);
        }
        Ok(out)
    }
}

/// Write the endianness flag that opens every payload.
pub fn put_endianness(buf: &mut Vec<u8>) {
    put_u8(buf, host_is_little_endian() as u8);
}

/// Read and verify the endianness flag. A mismatch refuses the payload.
pub fn check_endianness(reader: &mut WireReader<'_>) -> VeerResult<()> {
    let flag = reader.u8("endianness flag")? != 0;
    if flag != host_is_little_endian() {
        return Err(VeerError::Checkpoint(format!(
            "endianness mismatch: payload is {}-endian, host is {}-endian",
            if flag { "little" } else { "big" },
            if host_is_little_endian() { "little" } else { "big" },
        )));
    }
    Ok(())
}

/// Ring slot codec: an empty slot is written as two zero-length vectors.
pub fn put_slot(buf: &mut Vec<u8>, slot: &Option<FuzzExecution>) {
    match slot {
        Some(exec) => {
            put_u32_list(buf, &exec.trace);
            put_bytes(buf, &exec.input);
        }
        None => {
            put_u32(buf, 0);
            put_u32(buf, 0);
        }
    }
}

pub fn read_slot(reader: &mut WireReader<'_>) -> VeerResult<Option<FuzzExecution>> {
    let trace = reader.u32_list("slot trace")?;
    let input = reader.bytes("slot input")?;
    match (trace.is_empty(), input.is_empty()) {
        (true, true) => Ok(None),
        (false, false) => Ok(Some(FuzzExecution::new(input, trace))),
        _ => Err(VeerError::Wire(
            "ring slot with empty trace or empty input".to_string(),
        )),
    }
}

/// Graph payload: dimension, Node2Vec parameters, adjacency, embedding
/// table, zero embedding.
pub fn put_graph(buf: &mut Vec<u8>, graph: &GraphSnapshot) {
    put_u32(buf, graph.embedding_dim);
    put_f64(buf, graph.params.p);
    put_f64(buf, graph.params.q);
    put_u32(buf, graph.params.walk_length);
    put_u32(buf, graph.params.walks_per_node);
    put_u32(buf, graph.params.window);
    put_f64(buf, graph.params.learning_rate);

    put_u32(buf, graph.adjacency.len() as u32);
    for (node, neighbors) in &graph.adjacency {
        put_u32(buf, *node);
        put_u32_list(buf, neighbors);
    }

    put_u32(buf, graph.embeddings.len() as u32);
    for (node, emb) in &graph.embeddings {
        put_u32(buf, *node);
        put_f64_list(buf, emb);
    }

    put_f64_list(buf, &graph.zero_embedding);
}

pub fn read_graph(reader: &mut WireReader<'_>) -> VeerResult<GraphSnapshot> {
    let embedding_dim = reader.u32("embedding dimension")?;
    let params = Node2VecParams {
        p: reader.f64("p")?,
        q: reader.f64("q")?,
        walk_length: reader.u32("walk length")?,
        walks_per_node: reader.u32("walks per node")?,
        window: reader.u32("window")?,
        learning_rate: reader.f64("learning rate")?,
        ..Node2VecParams::default()
    };

    let node_count = reader.u32("adjacency node count")?;
    let mut adjacency = BTreeMap::new();
    for _ in 0..node_count {
        let node = reader.u32("adjacency node")?;
        let neighbors = reader.u32_list("neighbor list")?;
        adjacency.insert(node, neighbors);
    }

    let embedding_count = reader.u32("embedding count")?;
    let mut embeddings: BTreeMap<u32, Embedding> = BTreeMap::new();
    for _ in 0..embedding_count {
        let node = reader.u32("embedding node")?;
        let emb = reader.f64_list("embedding")?;
        embeddings.insert(node, emb);
    }

    let zero_embedding = reader.f64_list("zero embedding")?;

    let snapshot = GraphSnapshot {
        embedding_dim,
        params,
        adjacency,
        embeddings,
        zero_embedding,
    };
    validate_graph(&snapshot)?;
    Ok(snapshot)
}

/// Reject payloads whose graph breaks the model invariants: neighbor nodes
/// must be adjacency keys, adjacency keys must have embeddings, and every
/// embedding must match the recorded dimension.
fn validate_graph(graph: &GraphSnapshot) -> VeerResult<()> {
    let dim = graph.embedding_dim as usize;
    if graph.zero_embedding.len() != dim {
        return Err(VeerError::Wire(format!(
            "zero embedding has {} components, expected {dim}",
            graph.zero_embedding.len()
        )));
    }
    for (node, emb) in &graph.embeddings {
        if emb.len() != dim {
            return Err(VeerError::Wire(format!(
                "embedding of node {node:#x} has {} components, expected {dim}",
                emb.len()
            )));
        }
    }
    for (node, neighbors) in &graph.adjacency {
        if !graph.embeddings.contains_key(node) {
            return Err(VeerError::Wire(format!(
                "node {node:#x} has no embedding entry"
            )));
        }
        for neighbor in neighbors {
            if !graph.adjacency.contains_key(neighbor) {
                return Err(VeerError::Wire(format!(
                    "edge {node:#x} -> {neighbor:#x} references an unknown node"
                )));
            }
        }
    }
    Ok(())
}
