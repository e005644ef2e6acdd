//! Veer CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use veer::{
    load_checkpoint, load_seeds, region_name, settings_for, DrRunExecutor, FuzzerWorker,
    InputSizeRange, KnowledgeStore, RunStats, RunSummary, Settings, TraceRegion,
};

#[derive(Debug, Parser)]
#[command(name = "veer")]
#[command(about = "directional coverage-guided fuzzing for stdin-driven native targets")]
struct Cli {
    /// Path to the target program to fuzz.
    #[arg(long)]
    target: PathBuf,

    /// Extra arguments appended to the target invocation.
    #[arg(long = "target-arg")]
    target_args: Vec<String>,

    /// Minimum input length written to the target's stdin.
    #[arg(long)]
    min_length: u32,

    /// Maximum input length written to the target's stdin.
    #[arg(long)]
    max_length: u32,

    /// Input length step between workers.
    #[arg(long)]
    step_length: u32,

    /// Number of fuzzer workers to spawn.
    #[arg(long, default_value_t = 1)]
    thread_count: u32,

    /// Maximum number of interesting executions kept in the history ring.
    #[arg(long, default_value_t = 100)]
    max_history_count: u32,

    /// Path to the DBI tracer client library.
    #[arg(long, default_value = "./build/libtracer.so")]
    tracer: PathBuf,

    /// Path to the drrun launcher.
    #[arg(long, default_value = "./thirdparty/dynamorio/bin64/drrun")]
    drrun: PathBuf,

    /// Directory for checkpoints and crash artifacts.
    #[arg(long, default_value = "./veer_output")]
    work_dir: PathBuf,

    /// Directory of seed inputs to ingest before fuzzing.
    #[arg(long)]
    seed_path: Option<PathBuf>,

    /// Redirect the traced target's stdout/stderr to this file.
    #[arg(long, default_value = "/dev/null")]
    stdout_redirect: PathBuf,

    /// Dashboard refresh period in milliseconds.
    #[arg(long, default_value_t = 250)]
    ui_refresh: u64,

    /// Log level.
    #[arg(long, default_value = "info")]
    log: String,

    /// Machine-readable final summary on stdout (JSON).
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = settings_for(
            &self.target,
            &self.work_dir,
            InputSizeRange {
                min: self.min_length,
                max: self.max_length,
                step: self.step_length,
            },
        );
        settings.thread_count = self.thread_count;
        settings.max_history_count = self.max_history_count;
        settings.target_args = self.target_args.clone();
        settings.tracer_lib = self.tracer.clone();
        settings.drrun_path = self.drrun.clone();
        settings.seed_path = self.seed_path.clone();
        settings.stdout_redirect = self.stdout_redirect.clone();
        settings.ui_refresh_ms = self.ui_refresh;
        settings
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    match run(&cli) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let settings = cli.settings();
    settings.validate()?;
    settings.prepare_work_dir()?;

    let store = Arc::new(open_store(&settings));
    let stats = Arc::new(RunStats::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let run_id = uuid::Uuid::new_v4().to_string();

    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })?;
    }

    if let Some(seed_dir) = &settings.seed_path {
        tracing::info!(dir = %seed_dir.display(), "ingesting seeds");
        let region = TraceRegion::open(&region_name("seed"))?;
        let mut executor = DrRunExecutor::new(&settings, region, Arc::clone(&shutdown));
        let loaded = load_seeds(seed_dir, &store, &mut executor)?;
        tracing::info!(loaded, "seeds loaded into history");
    }

    let mut handles = Vec::new();
    for id in 0..settings.thread_count {
        let region = TraceRegion::open(&region_name(&id.to_string()))?;
        let executor = DrRunExecutor::new(&settings, region, Arc::clone(&shutdown));
        let mut worker = FuzzerWorker::new(
            id,
            &settings,
            Arc::clone(&store),
            executor,
            Arc::clone(&shutdown),
            Arc::clone(&stats),
        );
        handles.push(
            std::thread::Builder::new()
                .name(format!("veer-worker-{id}"))
                .spawn(move || {
                    if let Err(err) = worker.run() {
                        tracing::error!(worker = worker.id(), "worker failed: {err}");
                    }
                })?,
        );
    }

    // Dashboard loop: a status line every refresh period until shutdown is
    // requested or every worker has stopped on its own.
    let refresh = Duration::from_millis(settings.ui_refresh_ms.max(1));
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(refresh);
        let summary = RunSummary::capture(
            &run_id,
            &stats,
            &store,
            &settings.work_dir.display().to_string(),
        );
        tracing::info!("{}", summary.status_line());
        if handles.iter().all(|h| h.is_finished()) {
            break;
        }
    }
    shutdown.store(true, Ordering::Relaxed);

    for handle in handles {
        handle.join().ok();
    }

    let summary = RunSummary::capture(
        &run_id,
        &stats,
        &store,
        &settings.work_dir.display().to_string(),
    );
    if cli.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!("{}", summary.pretty());
    }
    Ok(ExitCode::SUCCESS)
}

/// Resume from the work directory's checkpoint when it belongs to the same
/// target; otherwise start fresh. A corrupt checkpoint is abandoned.
fn open_store(settings: &Settings) -> KnowledgeStore {
    let path = settings.checkpoint_path();
    if !path.exists() {
        return KnowledgeStore::new(settings);
    }
    match load_checkpoint(&path) {
        Ok(checkpoint) if checkpoint.matches_target(settings) => {
            tracing::info!(
                path = %path.display(),
                corpus = checkpoint.slots.iter().flatten().count(),
                "resuming from checkpoint"
            );
            KnowledgeStore::from_checkpoint(settings, checkpoint)
        }
        Ok(_) => {
            tracing::warn!(
                path = %path.display(),
                "checkpoint belongs to a different target; starting fresh"
            );
            KnowledgeStore::new(settings)
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                "abandoning unreadable checkpoint: {err}"
            );
            KnowledgeStore::new(settings)
        }
    }
}

fn print_error_and_exit(cli: &Cli, err: anyhow::Error) -> ExitCode {
    let msg = format!("{err:#}");
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "message": msg,
        });
        println!("{out}");
    } else {
        eprintln!("{msg}");
    }
    ExitCode::from(2)
}
