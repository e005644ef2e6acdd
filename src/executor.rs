//! Execution of the target under the external DBI tracer.

use std::io::Write as _;
use std::os::unix::process::ExitStatusExt as _;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{FuzzExecution, Settings, TraceRegion, VeerError, VeerResult};

/// Result of one target run. An empty trace is valid (a crash before any
/// instrumented block, for instance); it is skipped from insertion but still
/// counts as an execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub execution: FuzzExecution,
    /// Signal that terminated the target, when it crashed.
    pub signal: Option<i32>,
}

impl ExecOutcome {
    pub fn crashed(&self) -> bool {
        self.signal.is_some()
    }
}

/// Seam between the fuzzing loop and the external tracer. Production uses
/// [`DrRunExecutor`]; tests script outcomes in-process.
pub trait TargetExecutor {
    fn execute(&mut self, input: &[u8]) -> VeerResult<ExecOutcome>;
}

/// Runs the target under `drrun -c <tracer> -shm <region> -- <target>`,
/// feeding the input through a pipe on stdin and collecting the trace from
/// the worker's shared-memory region.
pub struct DrRunExecutor {
    region: TraceRegion,
    drrun: String,
    tracer_lib: String,
    target_argv: Vec<String>,
    stdout_redirect: std::path::PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl DrRunExecutor {
    pub fn new(settings: &Settings, region: TraceRegion, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            region,
            drrun: settings.drrun_path.display().to_string(),
            tracer_lib: settings.tracer_lib.display().to_string(),
            target_argv: settings.target_argv(),
            stdout_redirect: settings.stdout_redirect.clone(),
            shutdown,
        }
    }

    fn redirect_sink(&self) -> VeerResult<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.stdout_redirect)
            .map_err(|err| {
                VeerError::Target(format!(
                    "cannot open stdout redirect {}: {err}",
                    self.stdout_redirect.display()
                ))
            })
    }
}

impl TargetExecutor for DrRunExecutor {
    fn execute(&mut self, input: &[u8]) -> VeerResult<ExecOutcome> {
        if input.is_empty() {
            return Err(VeerError::Contract(
                "cannot execute an empty input".to_string(),
            ));
        }

        self.region.clear_count();

        let sink = self.redirect_sink()?;
        let sink_err = sink
            .try_clone()
            .map_err(|err| VeerError::Target(format!("cannot clone redirect sink: {err}")))?;

        let mut child = Command::new(&self.drrun)
            .arg("-c")
            .arg(&self.tracer_lib)
            .arg("-shm")
            .arg(self.region.name())
            .arg("--")
            .args(&self.target_argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::from(sink_err))
            .spawn()
            .map_err(|err| VeerError::Target(format!("failed to spawn {}: {err}", self.drrun)))?;

        // Deliver the input and close the pipe so the target sees EOF. A
        // write failure means the pipe broke before the buffer was accepted;
        // reap the child before surfacing it.
        let mut stdin = child.stdin.take().expect("stdin was piped");
        if let Err(err) = stdin.write_all(input) {
            drop(stdin);
            child.wait().ok();
            return Err(VeerError::Target(format!(
                "failed to write input to target stdin: {err}"
            )));
        }
        drop(stdin);

        // Poll instead of blocking in wait() so shutdown can terminate a
        // running child promptly.
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        child.kill().ok();
                        break child
                            .wait()
                            .map_err(|err| VeerError::Target(format!("wait failed: {err}")))?;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => {
                    return Err(VeerError::Target(format!("wait failed: {err}")));
                }
            }
        };

        let signal = status.signal();

        // The child is reaped; the count read below is ordered after every
        // write the tracer made.
        let trace = self.region.read_trace();

        Ok(ExecOutcome {
            execution: FuzzExecution::new(input.to_vec(), trace),
            signal,
        })
    }
}
