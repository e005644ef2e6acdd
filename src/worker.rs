//! Per-thread fuzzing loop.
//!
//! Each worker owns its executor (and with it a private trace region), a
//! per-worker input size, its own OS-seeded RNG, and an exploration-speed
//! vector. Workers share only the knowledge store and the shutdown flag.

use rand_chacha::ChaCha20Rng;
use rand_core::{OsRng, RngCore as _, SeedableRng as _};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    crash_file_name, mutator, CrashReport, ExecOutcome, ExplorationSpeed, FuzzExecution,
    FuzzInput, InputSizeRange, InsertOutcome, KnowledgeStore, RingSnapshot, RunStats, Settings,
    TargetExecutor, VeerError, VeerResult,
};

/// Input length fuzzed by worker `id`: `clamp(min + step*id, min, max)`.
pub fn worker_target_size(id: u32, size: InputSizeRange) -> usize {
    size.min
        .saturating_add(size.step.saturating_mul(id))
        .clamp(size.min, size.max) as usize
}

pub struct FuzzerWorker<E> {
    id: u32,
    target_size: usize,
    store: Arc<KnowledgeStore>,
    executor: E,
    speed: ExplorationSpeed,
    rng: ChaCha20Rng,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
    crash_dir: PathBuf,
    target_args: Vec<String>,
}

impl<E: TargetExecutor> FuzzerWorker<E> {
    pub fn new(
        id: u32,
        settings: &Settings,
        store: Arc<KnowledgeStore>,
        executor: E,
        shutdown: Arc<AtomicBool>,
        stats: Arc<RunStats>,
    ) -> Self {
        let mut seed_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut seed_bytes);
        let seed = u64::from_le_bytes(seed_bytes);
        tracing::debug!(worker = id, seed, "worker rng seeded");

        let target_size = worker_target_size(id, settings.input_size);
        Self {
            id,
            target_size,
            store,
            executor,
            speed: ExplorationSpeed::new(target_size),
            rng: rng_from_seed(seed),
            shutdown,
            stats,
            crash_dir: settings.work_dir.clone(),
            target_args: settings.target_argv(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Bootstrap the corpus if needed, then fuzz until shutdown.
    pub fn run(&mut self) -> VeerResult<()> {
        tracing::info!(
            worker = self.id,
            input_size = self.target_size,
            "worker starting"
        );
        self.bootstrap()?;
        if !self.shutdown.load(Ordering::Relaxed) {
            self.fuzz_loop()?;
        }
        tracing::info!(worker = self.id, "worker stopped");
        Ok(())
    }

    /// Run random and lightly mutated inputs until the shared store holds at
    /// least two executions with non-empty traces.
    fn bootstrap(&mut self) -> VeerResult<()> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            let snapshot = self.store.snapshot();
            let occupied = snapshot.occupied();
            if occupied >= 2 {
                return Ok(());
            }

            let input = if occupied == 0 {
                self.random_input(self.target_size)
            } else {
                let base = snapshot
                    .slots
                    .iter()
                    .flatten()
                    .next()
                    .expect("occupied slot exists")
                    .input
                    .clone();
                self.mutated_variant(base)
            };
            self.speed.resize_for(input.len());

            let outcome = self.executor.execute(&input)?;
            self.stats.record_execution();
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.handle_crash(&outcome);

            if !outcome.execution.trace.is_empty() {
                self.store.try_insert(outcome.execution)?;
            }
        }
    }

    fn fuzz_loop(&mut self) -> VeerResult<()> {
        self.speed.resize_for(self.target_size);
        let mut current = self.latest_execution()?;
        self.fit_to_target_size(&mut current.input);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            let snapshot = self.store.snapshot();
            let mut forbidden = self.pick_forbidden(&snapshot).ok_or_else(|| {
                VeerError::Contract("no forbidden execution available after bootstrap".to_string())
            })?;
            self.fit_to_target_size(&mut forbidden.input);
            self.fit_to_target_size(&mut current.input);

            let next_input =
                mutator::descend(self.store.graph(), &forbidden, &current, &self.speed);

            let outcome = self.executor.execute(&next_input)?;
            self.stats.record_execution();
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.handle_crash(&outcome);

            let mut added = false;
            if !outcome.execution.trace.is_empty() {
                added = self.store.try_insert(outcome.execution.clone())?
                    == InsertOutcome::Added;
            }

            // Bytes that just bought a new trace are frozen so the next
            // steps explore elsewhere; everything thaws a little each turn.
            if added {
                self.speed
                    .freeze_changed(&current.input, &outcome.execution.input);
            }
            self.speed.thaw(mutator::THAW_ACCELERATION);

            if !outcome.execution.trace.is_empty() {
                current = outcome.execution;
            }
        }
    }

    fn handle_crash(&self, outcome: &ExecOutcome) {
        let Some(signal) = outcome.signal else {
            return;
        };
        self.stats.record_crash();
        tracing::info!(worker = self.id, signal, "target crashed");

        let report = CrashReport {
            signal,
            target_args: self.target_args.clone(),
            input: outcome.execution.input.clone(),
            trace: outcome.execution.trace.clone(),
            graph: self.store.graph().snapshot(),
        };
        let path = self
            .crash_dir
            .join(crash_file_name(self.id, signal, &report.input));
        if let Err(err) = report.save(&path) {
            tracing::warn!(
                worker = self.id,
                path = %path.display(),
                "failed to write crash artifact: {err}"
            );
        }
    }

    /// Most recently written occupied slot.
    fn latest_execution(&self) -> VeerResult<FuzzExecution> {
        let snapshot = self.store.snapshot();
        let capacity = snapshot.slots.len();
        for back in 1..=capacity {
            let idx = (snapshot.write_idx + capacity - back) % capacity;
            if let Some(exec) = &snapshot.slots[idx] {
                return Ok(exec.clone());
            }
        }
        Err(VeerError::Contract(
            "store is empty after bootstrap".to_string(),
        ))
    }

    /// Uniform pick over occupied slots: scan forward from a random index
    /// and take the first occupied one.
    fn pick_forbidden(&mut self, snapshot: &RingSnapshot) -> Option<FuzzExecution> {
        let capacity = snapshot.slots.len();
        let start = (self.rng.next_u64() as usize) % capacity;
        for offset in 0..capacity {
            let idx = (start + offset) % capacity;
            if let Some(exec) = &snapshot.slots[idx] {
                return Some(exec.clone());
            }
        }
        None
    }

    fn random_input(&mut self, len: usize) -> FuzzInput {
        (0..len).map(|_| self.random_byte()).collect()
    }

    /// Second bootstrap input: the stored input fitted to this worker's
    /// size, with 10% to 60% of its bytes re-randomized (at least one).
    fn mutated_variant(&mut self, mut base: FuzzInput) -> FuzzInput {
        self.fit_to_target_size(&mut base);

        let fraction = 0.10 + self.unit_f64() * 0.50;
        let mut positions = ((base.len() as f64) * fraction) as usize;
        if positions == 0 {
            positions = 1;
        }

        let mut chosen = BTreeSet::new();
        while chosen.len() < positions {
            chosen.insert((self.rng.next_u64() as usize) % base.len());
        }
        for idx in chosen {
            base[idx] = self.random_byte();
        }
        base
    }

    /// Resize an input to this worker's size, padding growth with random
    /// bytes.
    fn fit_to_target_size(&mut self, input: &mut FuzzInput) {
        while input.len() < self.target_size {
            let byte = self.random_byte();
            input.push(byte);
        }
        input.truncate(self.target_size);
    }

    fn random_byte(&mut self) -> u8 {
        (self.rng.next_u64() & 0xFF) as u8
    }

    fn unit_f64(&mut self) -> f64 {
        (self.rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

fn rng_from_seed(seed: u64) -> ChaCha20Rng {
    let digest = blake3::hash(&seed.to_le_bytes());
    let mut seed32 = [0u8; 32];
    seed32.copy_from_slice(&digest.as_bytes()[..32]);
    ChaCha20Rng::from_seed(seed32)
}
