//! End-to-end flows of the fuzzing loop against scripted in-process targets.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use veer::{
    embedding_loss, load_checkpoint, worker_target_size, CrashReport, ExecOutcome, FuzzExecution,
    FuzzerWorker, InputSizeRange, KnowledgeStore, RunStats, Settings, TargetExecutor, VeerResult,
};

fn temp_workspace(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("veer-flows-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp workspace");
    root
}

fn settings(work_dir: &Path, size: InputSizeRange) -> Settings {
    veer::settings_for(Path::new("/opt/targets/demo"), work_dir, size)
}

/// In-process stand-in for the tracer: maps inputs to outcomes via a
/// closure and requests shutdown after a fixed number of executions.
struct ScriptedExecutor<F> {
    calls: u64,
    limit: u64,
    shutdown: Arc<AtomicBool>,
    script: F,
}

impl<F> ScriptedExecutor<F> {
    fn new(limit: u64, shutdown: Arc<AtomicBool>, script: F) -> Self {
        Self {
            calls: 0,
            limit,
            shutdown,
            script,
        }
    }
}

impl<F: FnMut(&[u8]) -> ExecOutcome> TargetExecutor for ScriptedExecutor<F> {
    fn execute(&mut self, input: &[u8]) -> VeerResult<ExecOutcome> {
        self.calls += 1;
        if self.calls >= self.limit {
            self.shutdown.store(true, Ordering::Relaxed);
        }
        Ok((self.script)(input))
    }
}

fn outcome(input: &[u8], trace: &[u32]) -> ExecOutcome {
    ExecOutcome {
        execution: FuzzExecution::new(input.to_vec(), trace.to_vec()),
        signal: None,
    }
}

#[test]
fn constant_target_stabilizes_on_one_trace() {
    let ws = temp_workspace("noop");
    let settings = settings(&ws, InputSizeRange { min: 6, max: 6, step: 0 });
    let store = Arc::new(KnowledgeStore::new(&settings));
    let stats = Arc::new(RunStats::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let executor = ScriptedExecutor::new(100, Arc::clone(&shutdown), |input: &[u8]| {
        outcome(input, &[0x100, 0x200])
    });
    let mut worker = FuzzerWorker::new(
        0,
        &settings,
        Arc::clone(&store),
        executor,
        Arc::clone(&shutdown),
        Arc::clone(&stats),
    );
    worker.run().expect("worker run");

    // Every run produced the same trace, so exactly one slot is occupied
    // and the counter still saw every execution.
    assert_eq!(stats.executions(), 100);
    assert_eq!(store.occupied(), 1);

    let snapshot = store.snapshot();
    let only = snapshot
        .slots
        .iter()
        .flatten()
        .next()
        .expect("one stored execution");
    assert_eq!(only.trace, vec![0x100, 0x200]);
    let loss = embedding_loss(store.graph(), &only.trace, &only.trace);
    assert!((loss - 1.0).abs() < 1e-9, "self-loss {loss} != 1.0");
}

#[test]
fn branching_target_populates_both_paths() {
    let ws = temp_workspace("branch");
    let settings = settings(&ws, InputSizeRange { min: 4, max: 4, step: 0 });
    let store = Arc::new(KnowledgeStore::new(&settings));
    let stats = Arc::new(RunStats::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let low: Vec<u32> = vec![0x10, 0x20, 0x30];
    let high: Vec<u32> = vec![0x10, 0x40, 0x50];
    let (low_script, high_script) = (low.clone(), high.clone());
    let executor = ScriptedExecutor::new(400, Arc::clone(&shutdown), move |input: &[u8]| {
        if input[0] < 128 {
            outcome(input, &low_script)
        } else {
            outcome(input, &high_script)
        }
    });
    let mut worker = FuzzerWorker::new(
        0,
        &settings,
        Arc::clone(&store),
        executor,
        Arc::clone(&shutdown),
        Arc::clone(&stats),
    );
    worker.run().expect("worker run");

    let snapshot = store.snapshot();
    let traces: Vec<&Vec<u32>> = snapshot.slots.iter().flatten().map(|e| &e.trace).collect();
    assert!(traces.contains(&&low), "low branch missing from corpus");
    assert!(traces.contains(&&high), "high branch missing from corpus");

    // Both branch bodies are graph nodes reachable from the shared head.
    let graph = store.graph().snapshot();
    assert!(graph.adjacency.contains_key(&0x20));
    assert!(graph.adjacency.contains_key(&0x40));
    assert!(graph.adjacency[&0x10].contains(&0x20));
    assert!(graph.adjacency[&0x10].contains(&0x40));
}

#[test]
fn crashes_emit_loadable_artifacts_and_do_not_stop_the_loop() {
    let ws = temp_workspace("crash");
    let settings = settings(&ws, InputSizeRange { min: 6, max: 6, step: 0 });
    let store = Arc::new(KnowledgeStore::new(&settings));
    let stats = Arc::new(RunStats::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    // Two clean bootstrap traces, then every execution segfaults.
    let mut call = 0u64;
    let executor = ScriptedExecutor::new(12, Arc::clone(&shutdown), move |input: &[u8]| {
        call += 1;
        match call {
            1 => outcome(input, &[0x10, 0x20]),
            2 => outcome(input, &[0x10, 0x30]),
            _ => ExecOutcome {
                execution: FuzzExecution::new(input.to_vec(), vec![0x10, 0xdead]),
                signal: Some(11),
            },
        }
    });
    let mut worker = FuzzerWorker::new(
        0,
        &settings,
        Arc::clone(&store),
        executor,
        Arc::clone(&shutdown),
        Arc::clone(&stats),
    );
    worker.run().expect("worker run");

    // Crashes were recorded but the loop kept executing until shutdown.
    assert_eq!(stats.executions(), 12);
    assert!(stats.crashes() >= 1);

    let artifact = std::fs::read_dir(&ws)
        .expect("read work dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("crash_w0_sig11_") && n.ends_with(".crash"))
        })
        .expect("crash artifact written");

    let report = CrashReport::load(&artifact).expect("load crash artifact");
    assert_eq!(report.signal, 11);
    assert_eq!(report.input.len(), 6);
    assert_eq!(report.trace, vec![0x10, 0xdead]);
    assert_eq!(report.target_args, vec!["/opt/targets/demo".to_string()]);
    assert!(!report.graph.adjacency.is_empty());
}

#[test]
fn corpus_survives_a_restart_via_the_checkpoint() {
    let ws = temp_workspace("restart");
    let settings = settings(&ws, InputSizeRange { min: 4, max: 4, step: 0 });

    let first_snapshot;
    let first_nodes: Vec<u32>;
    {
        let store = Arc::new(KnowledgeStore::new(&settings));
        let stats = Arc::new(RunStats::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let executor = ScriptedExecutor::new(200, Arc::clone(&shutdown), |input: &[u8]| {
            if input[0] < 128 {
                outcome(input, &[0x10, 0x20, 0x30])
            } else {
                outcome(input, &[0x10, 0x40, 0x50])
            }
        });
        let mut worker = FuzzerWorker::new(
            0,
            &settings,
            Arc::clone(&store),
            executor,
            Arc::clone(&shutdown),
            Arc::clone(&stats),
        );
        worker.run().expect("first run");

        first_snapshot = store.snapshot();
        first_nodes = store.graph().snapshot().adjacency.keys().copied().collect();
        assert!(first_snapshot.occupied() >= 2);
    }

    // Restart: the persisted ring comes back verbatim.
    let checkpoint = load_checkpoint(&settings.checkpoint_path()).expect("load checkpoint");
    assert!(checkpoint.matches_target(&settings));
    let resumed = Arc::new(KnowledgeStore::from_checkpoint(&settings, checkpoint));
    let resumed_snapshot = resumed.snapshot();
    assert_eq!(resumed_snapshot.slots, first_snapshot.slots);
    assert_eq!(resumed_snapshot.write_idx, first_snapshot.write_idx);

    // Fuzzing on adds knowledge; the graph only ever grows.
    let stats = Arc::new(RunStats::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let executor = ScriptedExecutor::new(40, Arc::clone(&shutdown), |input: &[u8]| {
        outcome(input, &[0x10, 0x60, 0x70])
    });
    let mut worker = FuzzerWorker::new(
        0,
        &settings,
        Arc::clone(&resumed),
        executor,
        Arc::clone(&shutdown),
        Arc::clone(&stats),
    );
    worker.run().expect("second run");

    let grown = resumed.graph().snapshot();
    for node in &first_nodes {
        assert!(
            grown.adjacency.contains_key(node),
            "node {node:#x} lost across restart"
        );
    }
    assert!(grown.adjacency.contains_key(&0x60));
}

#[test]
fn workers_fuzz_at_their_own_input_sizes() {
    let ws = temp_workspace("sizes");
    let size = InputSizeRange { min: 8, max: 14, step: 2 };
    let settings = settings(&ws, size);
    let store = Arc::new(KnowledgeStore::new(&settings));

    for id in 0..4u32 {
        let expected = worker_target_size(id, size);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_script = Arc::clone(&seen);

        let stats = Arc::new(RunStats::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let executor = ScriptedExecutor::new(30, Arc::clone(&shutdown), move |input: &[u8]| {
            seen_in_script.lock().unwrap().push(input.len());
            // One distinct trace per input size.
            outcome(input, &[input.len() as u32, 0x1])
        });
        let mut worker = FuzzerWorker::new(
            id,
            &settings,
            Arc::clone(&store),
            executor,
            Arc::clone(&shutdown),
            Arc::clone(&stats),
        );
        assert_eq!(worker.target_size(), expected);
        worker.run().expect("worker run");

        let lengths = seen.lock().unwrap();
        assert!(!lengths.is_empty());
        assert!(
            lengths.iter().all(|&len| len == expected),
            "worker {id} produced off-schedule input sizes: {lengths:?}"
        );
    }

    // The shared corpus holds traces produced at every configured size.
    let stored_sizes: Vec<usize> = store
        .snapshot()
        .slots
        .iter()
        .flatten()
        .map(|e| e.input.len())
        .collect();
    for expected in [8, 10, 12, 14] {
        assert!(
            stored_sizes.contains(&expected),
            "no stored execution at size {expected} (got {stored_sizes:?})"
        );
    }
}
