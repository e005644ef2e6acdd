//! Effective fuzzer settings assembled from the CLI.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::{VeerError, VeerResult};

pub const DEFAULT_MAX_HISTORY: u32 = 100;
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.veer";

/// Input-length schedule: worker `i` fuzzes at `clamp(min + step*i, min, max)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InputSizeRange {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub input_size: InputSizeRange,
    pub thread_count: u32,
    pub max_history_count: u32,

    /// Target binary handed to the tracer after `--`.
    pub target_program: PathBuf,
    /// Extra arguments for the target, appended after the program path.
    pub target_args: Vec<String>,
    /// DBI client library loaded by drrun.
    pub tracer_lib: PathBuf,
    pub drrun_path: PathBuf,

    /// Directory for checkpoints and crash artifacts. Created if missing.
    pub work_dir: PathBuf,
    /// Optional directory of seed inputs ingested before fuzzing starts.
    pub seed_path: Option<PathBuf>,
    /// Sink for the traced child's stdout/stderr.
    pub stdout_redirect: PathBuf,

    /// Dashboard refresh period in milliseconds.
    pub ui_refresh_ms: u64,
}

impl Settings {
    /// Reject schedules the workers cannot honor. Inputs are non-empty by
    /// invariant, so a zero minimum length is an error.
    pub fn validate(&self) -> VeerResult<()> {
        if self.input_size.min == 0 {
            return Err(VeerError::InvalidArgument(
                "--min-length must be at least 1".to_string(),
            ));
        }
        if self.input_size.min > self.input_size.max {
            return Err(VeerError::InvalidArgument(format!(
                "--min-length {} exceeds --max-length {}",
                self.input_size.min, self.input_size.max
            )));
        }
        if self.thread_count == 0 {
            return Err(VeerError::InvalidArgument(
                "--thread-count must be at least 1".to_string(),
            ));
        }
        if self.max_history_count == 0 {
            return Err(VeerError::InvalidArgument(
                "--max-history-count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create the work directory if needed; an existing non-directory path
    /// at that location is an error.
    pub fn prepare_work_dir(&self) -> VeerResult<()> {
        if self.work_dir.exists() {
            if !self.work_dir.is_dir() {
                return Err(VeerError::InvalidArgument(format!(
                    "work dir {} exists but is not a directory",
                    self.work_dir.display()
                )));
            }
            return Ok(());
        }
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.work_dir.join(CHECKPOINT_FILE_NAME)
    }

    /// Argument vector recorded in crash artifacts: everything after the
    /// `--` separator of the tracer invocation.
    pub fn target_argv(&self) -> Vec<String> {
        let mut argv = vec![self.target_program.display().to_string()];
        argv.extend(self.target_args.iter().cloned());
        argv
    }
}

/// Baseline settings for a target and work directory; the CLI overlays its
/// flags on top of these defaults.
pub fn settings_for(target: &Path, work_dir: &Path, size: InputSizeRange) -> Settings {
    Settings {
        input_size: size,
        thread_count: 1,
        max_history_count: DEFAULT_MAX_HISTORY,
        target_program: target.to_path_buf(),
        target_args: Vec::new(),
        tracer_lib: PathBuf::from("./build/libtracer.so"),
        drrun_path: PathBuf::from("./thirdparty/dynamorio/bin64/drrun"),
        work_dir: work_dir.to_path_buf(),
        seed_path: None,
        stdout_redirect: PathBuf::from("/dev/null"),
        ui_refresh_ms: 250,
    }
}
