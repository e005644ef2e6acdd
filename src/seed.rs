//! Seed ingestion: execute user-provided inputs once and fold the
//! interesting ones into the knowledge store before fuzzing starts.

use walkdir::WalkDir;

use std::path::Path;

use crate::{InsertOutcome, KnowledgeStore, TargetExecutor, VeerError, VeerResult};

/// Run every regular file in `seed_dir` through the target and insert the
/// executions with non-empty traces. Returns the number of seeds that
/// entered the store; unreadable, empty, duplicate, and traceless seeds are
/// skipped with a log line.
pub fn load_seeds<E: TargetExecutor>(
    seed_dir: &Path,
    store: &KnowledgeStore,
    executor: &mut E,
) -> VeerResult<u32> {
    if !seed_dir.is_dir() {
        return Err(VeerError::InvalidArgument(format!(
            "seed path {} is not a directory",
            seed_dir.display()
        )));
    }

    let mut loaded = 0u32;
    let mut skipped = 0u32;

    for entry in WalkDir::new(seed_dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("skipping unreadable seed entry: {err}");
                skipped += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let input = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(seed = %path.display(), "failed to read seed: {err}");
                skipped += 1;
                continue;
            }
        };
        if input.is_empty() {
            tracing::debug!(seed = %path.display(), "skipping empty seed");
            skipped += 1;
            continue;
        }

        let outcome = executor.execute(&input)?;
        if let Some(signal) = outcome.signal {
            tracing::warn!(seed = %path.display(), signal, "seed input crashed the target");
        }

        if outcome.execution.trace.is_empty() {
            tracing::debug!(seed = %path.display(), "seed produced no trace");
            skipped += 1;
            continue;
        }

        match store.try_insert(outcome.execution)? {
            InsertOutcome::Added => {
                tracing::info!(seed = %path.display(), "seed loaded");
                loaded += 1;
            }
            InsertOutcome::Duplicate => {
                tracing::debug!(seed = %path.display(), "seed trace already known");
                skipped += 1;
            }
        }
    }

    tracing::info!(loaded, skipped, "seed ingestion complete");
    Ok(loaded)
}
