//! Run-wide counters and the status surface read by the dashboard.

use serde::{Deserialize, Serialize};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::KnowledgeStore;

/// Counters shared by all workers. Incremented without holding any lock.
#[derive(Debug)]
pub struct RunStats {
    executions: AtomicU64,
    crashes: AtomicU64,
    started: Instant,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            executions: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_crash(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Point-in-time view of the run, printable as text or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub executions: u64,
    pub crashes: u64,
    pub corpus: usize,
    pub graph_nodes: usize,
    pub elapsed_secs: u64,
    pub work_dir: String,
}

impl RunSummary {
    pub fn capture(run_id: &str, stats: &RunStats, store: &KnowledgeStore, work_dir: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            executions: stats.executions(),
            crashes: stats.crashes(),
            corpus: store.occupied(),
            graph_nodes: store.graph().node_count(),
            elapsed_secs: stats.elapsed_secs(),
            work_dir: work_dir.to_string(),
        }
    }

    pub fn status_line(&self) -> String {
        format!(
            "execs={} crashes={} corpus={} nodes={} elapsed={}s",
            self.executions, self.crashes, self.corpus, self.graph_nodes, self.elapsed_secs
        )
    }

    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("run {}\n", self.run_id));
        out.push_str(&format!("  executions:  {}\n", self.executions));
        out.push_str(&format!("  crashes:     {}\n", self.crashes));
        out.push_str(&format!("  corpus:      {}\n", self.corpus));
        out.push_str(&format!("  graph nodes: {}\n", self.graph_nodes));
        out.push_str(&format!("  elapsed:     {}s\n", self.elapsed_secs));
        out.push_str(&format!("  work dir:    {}", self.work_dir));
        out
    }
}
