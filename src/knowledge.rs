//! Bounded, deduplicating history of interesting executions.
//!
//! The store is the only shared mutable state between workers (together with
//! the graph engine it owns). A fixed-capacity ring holds distinct-trace
//! executions; every successful insert feeds the graph and writes a
//! best-effort checkpoint.

use std::path::PathBuf;
use std::sync::Mutex;

use crate::{
    checkpoint, Checkpoint, FuzzExecution, Node2VecParams, Settings, TraceGraph, VeerError,
    VeerResult, DEFAULT_EMBEDDING_DIM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    Duplicate,
}

/// Consistent copy of the ring taken under the store lock.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    pub slots: Vec<Option<FuzzExecution>>,
    pub write_idx: usize,
}

impl RingSnapshot {
    pub fn occupied(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[derive(Debug)]
struct RingState {
    slots: Vec<Option<FuzzExecution>>,
    write_idx: usize,
}

#[derive(Debug)]
pub struct KnowledgeStore {
    settings: Settings,
    graph: TraceGraph,
    checkpoint_path: PathBuf,
    ring: Mutex<RingState>,
}

impl KnowledgeStore {
    pub fn new(settings: &Settings) -> Self {
        let capacity = settings.max_history_count as usize;
        Self {
            settings: settings.clone(),
            graph: TraceGraph::new(DEFAULT_EMBEDDING_DIM, Node2VecParams::default()),
            checkpoint_path: settings.checkpoint_path(),
            ring: Mutex::new(RingState {
                slots: vec![None; capacity],
                write_idx: 0,
            }),
        }
    }

    /// Adopt a previously persisted ring and graph. The ring is fitted to
    /// the current capacity: shorter checkpoints pad with empty slots,
    /// longer ones are truncated.
    pub fn from_checkpoint(settings: &Settings, checkpoint: Checkpoint) -> Self {
        let capacity = settings.max_history_count as usize;
        let mut slots = checkpoint.slots;
        slots.resize(capacity, None);
        Self {
            settings: settings.clone(),
            graph: TraceGraph::from_snapshot(checkpoint.graph),
            checkpoint_path: settings.checkpoint_path(),
            ring: Mutex::new(RingState {
                slots,
                write_idx: checkpoint.write_idx as usize % capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.settings.max_history_count as usize
    }

    /// Handle to the graph engine for mutator computations. The engine has
    /// its own lock.
    pub fn graph(&self) -> &TraceGraph {
        &self.graph
    }

    /// Insert `execution` unless an identical trace is already live in the
    /// ring. On success the trace is absorbed into the graph, embeddings are
    /// retrained, and a checkpoint is written best-effort.
    pub fn try_insert(&self, execution: FuzzExecution) -> VeerResult<InsertOutcome> {
        if execution.trace.is_empty() {
            return Err(VeerError::Contract(
                "cannot store an execution with an empty trace".to_string(),
            ));
        }
        if execution.input.is_empty() {
            return Err(VeerError::Contract(
                "cannot store an execution with an empty input".to_string(),
            ));
        }

        let mut ring = self.ring.lock().expect("store lock poisoned");

        let duplicate = ring
            .slots
            .iter()
            .flatten()
            .any(|existing| existing.trace == execution.trace);
        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }

        let idx = ring.write_idx;
        tracing::debug!(
            slot = idx,
            trace_len = execution.trace.len(),
            input_len = execution.input.len(),
            "storing new trace"
        );
        self.graph.absorb_trace(&execution.trace);
        self.graph.train_embeddings();
        ring.slots[idx] = Some(execution);
        ring.write_idx = (idx + 1) % ring.slots.len();

        // Checkpoints are best-effort; a failed write never fails the insert.
        let snapshot = RingSnapshot {
            slots: ring.slots.clone(),
            write_idx: ring.write_idx,
        };
        if let Err(err) = checkpoint::write_checkpoint(
            &self.checkpoint_path,
            &self.settings,
            &snapshot,
            &self.graph.snapshot(),
        ) {
            tracing::warn!(
                path = %self.checkpoint_path.display(),
                "checkpoint write failed: {err}"
            );
        }

        Ok(InsertOutcome::Added)
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let ring = self.ring.lock().expect("store lock poisoned");
        RingSnapshot {
            slots: ring.slots.clone(),
            write_idx: ring.write_idx,
        }
    }

    pub fn occupied(&self) -> usize {
        let ring = self.ring.lock().expect("store lock poisoned");
        ring.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{settings_for, InputSizeRange};
    use std::path::Path;

    fn test_store(capacity: u32) -> KnowledgeStore {
        let dir = std::env::temp_dir().join(format!(
            "veer-store-test-{}-{}",
            std::process::id(),
            capacity
        ));
        std::fs::create_dir_all(&dir).expect("create temp work dir");
        let mut settings = settings_for(
            Path::new("/bin/true"),
            &dir,
            InputSizeRange { min: 4, max: 4, step: 0 },
        );
        settings.max_history_count = capacity;
        KnowledgeStore::new(&settings)
    }

    fn exec(input: &[u8], trace: &[u32]) -> FuzzExecution {
        FuzzExecution::new(input.to_vec(), trace.to_vec())
    }

    #[test]
    fn duplicate_traces_are_rejected_until_evicted() {
        let store = test_store(8);
        assert_eq!(
            store.try_insert(exec(&[1], &[10, 20])).unwrap(),
            InsertOutcome::Added
        );
        assert_eq!(
            store.try_insert(exec(&[2], &[10, 20])).unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(
            store.try_insert(exec(&[2], &[10, 21])).unwrap(),
            InsertOutcome::Added
        );
        assert_eq!(store.occupied(), 2);
    }

    #[test]
    fn ring_never_exceeds_capacity() {
        let store = test_store(3);
        for i in 0..10u32 {
            store.try_insert(exec(&[i as u8 + 1], &[i, i + 1])).unwrap();
        }
        assert_eq!(store.occupied(), 3);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.slots.len(), 3);
        // 10 inserts into 3 slots: the write index wrapped to 10 % 3.
        assert_eq!(snapshot.write_idx, 1);
    }

    #[test]
    fn empty_trace_or_input_is_a_contract_violation() {
        let store = test_store(4);
        assert!(matches!(
            store.try_insert(exec(&[1], &[])),
            Err(VeerError::Contract(_))
        ));
        assert!(matches!(
            store.try_insert(exec(&[], &[1])),
            Err(VeerError::Contract(_))
        ));
    }

    #[test]
    fn inserts_feed_the_graph() {
        let store = test_store(4);
        store.try_insert(exec(&[1], &[100, 200, 300])).unwrap();
        assert_eq!(store.graph().node_count(), 3);
        store.try_insert(exec(&[2], &[100, 400])).unwrap();
        assert_eq!(store.graph().node_count(), 4);
    }
}
