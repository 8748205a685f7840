/*!
 * Shredspace - secure file deletion
 *
 * Command-line front end for the deletion engine: selects files, confirms
 * with the operator, drives a batch and reports what happened to each file.
 */

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;
use walkdir::WalkDir;

use shredspace::method;
use shredspace::storage;
use shredspace::{
    BatchCoordinator, BatchRequest, BatchResult, CancellationToken, Config, DeletionConfig,
    DeletionJob, DeletionMethod, FileOutcome, PassObserver, PassReport, SkipReason, VerifyMode,
};

mod utils;

#[derive(Parser)]
#[command(name = "shredspace")]
#[command(about = "Overwrite, verify and unlink files beyond casual recovery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    no_color: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Securely delete files
    Shred(ShredArgs),

    /// List deletion methods and their pass plans
    Methods,

    /// Report whether in-place overwrites can be trusted for each path
    Probe {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Write a configuration file (JSON or YAML by extension) holding the defaults
    InitConfig {
        path: PathBuf,

        #[arg(long)]
        force: bool,
    },

    /// Measure throughput of each method on scratch files
    Benchmark {
        #[arg(short, long, default_value = "8388608")] // 8MB
        size: usize,

        /// Directory to place scratch files in
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ShredArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// zero, random, dod or aes
    #[arg(short, long)]
    method: Option<String>,

    /// Pass count for zero and random (1-99)
    #[arg(short, long)]
    passes: Option<u32>,

    #[arg(short, long)]
    recursive: bool,

    /// Copy each file to the backup directory before destroying it
    #[arg(long)]
    backup: bool,

    #[arg(long)]
    backup_dir: Option<PathBuf>,

    #[arg(short, long)]
    workers: Option<usize>,

    /// Verify every chunk instead of a sample
    #[arg(long)]
    full_verify: bool,

    /// Write the batch result as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = setup_logging(&cli.log_level, cli.no_color, cli.log_file.as_deref())?;

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    info!("Shredspace v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Shred(args) => handle_shred(args, &config).await,
        Commands::Methods => handle_methods(&config),
        Commands::Probe { paths } => handle_probe(&paths),
        Commands::InitConfig { path, force } => handle_init_config(&path, force),
        Commands::Benchmark { size, dir } => handle_benchmark(size, dir, &config).await,
    }
}

async fn handle_shred(args: ShredArgs, config: &Config) -> Result<()> {
    let method: DeletionMethod = match &args.method {
        Some(name) => name.parse()?,
        None => config.method()?,
    };
    let passes = args.passes.unwrap_or_else(|| config.passes());

    let mut options = config.engine_options()?;
    if let Some(workers) = args.workers {
        options.worker_limit = workers;
    }
    if args.full_verify {
        options.verify_mode = VerifyMode::Full;
    }

    let mut deletion = DeletionConfig::new(method, passes);
    let backup_enabled =
        args.backup || args.backup_dir.is_some() || config.backup_enabled.unwrap_or(false);
    if backup_enabled {
        let dir = args
            .backup_dir
            .clone()
            .or_else(|| config.backup_directory.clone())
            .or_else(default_backup_dir)
            .context("no backup directory configured and no local data directory available")?;
        deletion = deletion.with_backup(dir);
    }
    // Fail on a bad method or pass count before asking the operator anything
    deletion.validate()?;

    let targets = collect_targets(&args.paths, args.recursive)?;
    if targets.is_empty() {
        warn!("Nothing to delete");
        return Ok(());
    }

    let total_bytes: u64 = targets
        .iter()
        .filter_map(|t| std::fs::symlink_metadata(t).ok())
        .map(|m| m.len())
        .sum();
    if !args.yes {
        let prompt = format!(
            "Permanently destroy {} file(s), {}, using {}? [y/N] ",
            targets.len(),
            utils::format_bytes(total_bytes),
            method
        );
        if !utils::prompt_confirm(&prompt)? {
            info!("Aborted by operator");
            return Ok(());
        }
    }

    let observer: Arc<dyn PassObserver> = Arc::new(|report: &PassReport| {
        debug!(
            job_id = %report.job_id,
            pass = report.pass.index,
            total = report.total_passes,
            kind = %report.pass.kind,
            bytes = report.bytes_written,
            "pass complete"
        );
    });
    let coordinator = BatchCoordinator::new(options)?.with_pass_observer(observer);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; files already in progress will finish");
                cancel.cancel();
            }
        });
    }

    let bar = ProgressBar::new(targets.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")?
            .progress_chars("=> "),
    );
    let bar_handle = bar.clone();

    info!("Deleting {} file(s) with {}", targets.len(), method);
    let request = BatchRequest::new(targets, deletion).with_cancellation(cancel);
    let result = coordinator
        .execute_with_progress(request, move |event| {
            bar_handle.set_position(event.completed as u64);
            bar_handle.set_message(event.path.display().to_string());
        })
        .await?;
    bar.finish_and_clear();

    print_summary(&result);

    if let Some(report) = args.report {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&report, json)
            .with_context(|| format!("failed to write report to {}", report.display()))?;
        info!("Report saved to: {}", report.display());
    }

    if !result.all_succeeded() {
        error!("Some files were not securely deleted");
        return Err(anyhow::anyhow!(
            "{} of {} files were not securely deleted",
            result.len() - result.succeeded(),
            result.len()
        ));
    }

    Ok(())
}

fn handle_methods(config: &Config) -> Result<()> {
    for method in DeletionMethod::ALL {
        let plan = method::plan(method, config.passes())?;
        let passes = plan
            .iter()
            .map(|p| p.kind.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let note = if method.honours_pass_count() {
            "pass count configurable 1-99"
        } else {
            "fixed"
        };
        println!("{:<15} {} pass(es): {} ({})", method.to_string(), plan.len(), passes, note);
    }
    Ok(())
}

fn handle_probe(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let assessment = storage::assess(path);
        println!(
            "{}: {:?} [{}] {}",
            path.display(),
            assessment.guarantee,
            assessment.filesystem.as_deref().unwrap_or("unknown"),
            assessment.reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn handle_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow::anyhow!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        ));
    }
    Config::default()
        .save_to_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("Configuration written to: {}", path.display());
    Ok(())
}

async fn handle_benchmark(size: usize, dir: Option<PathBuf>, config: &Config) -> Result<()> {
    info!("Running deletion benchmarks");

    let options = config.engine_options()?;
    let scratch = dir
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("shredspace-bench-{}", Uuid::new_v4().simple()));
    tokio::fs::create_dir_all(&scratch)
        .await
        .with_context(|| format!("failed to create {}", scratch.display()))?;

    println!("\nBenchmark Results ({}):", utils::format_bytes(size as u64));
    println!("==================");

    for method in DeletionMethod::ALL {
        let path = scratch.join(format!("{}.bin", method));
        tokio::fs::write(&path, vec![0xA5u8; size]).await?;

        let passes = DeletionConfig::new(method, config.passes()).validate()?;
        let mut job = DeletionJob::new(&path, method, passes, options);
        let started = Instant::now();
        let outcome = job.run(None, None).await;
        let elapsed = started.elapsed();

        match outcome {
            FileOutcome::Success { bytes_written, .. } => {
                let mbps = bytes_written as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON);
                println!(
                    "{}: {:.2} MB/s ({:.2} ms per file)",
                    method,
                    mbps,
                    elapsed.as_secs_f64() * 1000.0
                );
            }
            other => warn!("{} did not complete: {:?}", method, other),
        }
    }

    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
        warn!("Could not remove {}: {}", scratch.display(), e);
    }
    Ok(())
}

fn collect_targets(paths: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    for path in paths {
        if path.is_dir() {
            if !recursive {
                return Err(anyhow::anyhow!(
                    "{} is a directory; pass --recursive to delete its files",
                    path.display()
                ));
            }
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry.with_context(|| format!("failed to walk {}", path.display()))?;
                if entry.file_type().is_file() {
                    targets.push(entry.into_path());
                }
            }
        } else {
            targets.push(path.clone());
        }
    }
    Ok(targets)
}

fn default_backup_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("shredspace").join("backups"))
}

fn print_summary(result: &BatchResult) {
    println!("\nBatch {}", result.batch_id);
    for (path, outcome) in &result.outcomes {
        let status = match outcome {
            FileOutcome::Success {
                passes,
                bytes_written,
            } => format!(
                "deleted   {} pass(es), {}",
                passes,
                utils::format_bytes(*bytes_written)
            ),
            FileOutcome::PartialFailure {
                passes_completed,
                reason,
            } => format!("FAILED    after {} pass(es): {}", passes_completed, reason),
            FileOutcome::Skipped {
                reason: SkipReason::AlreadyInProgress,
            } => "skipped   already being deleted".to_string(),
            FileOutcome::Skipped {
                reason: SkipReason::Cancelled,
            } => "skipped   cancelled".to_string(),
            FileOutcome::BackupFailed { reason } => format!("KEPT      {}", reason),
        };
        println!("  {}  {}", status, path.display());
    }
    for (path, assessment) in &result.warnings {
        println!(
            "  warning   {}: {}",
            path.display(),
            assessment
                .reason
                .as_deref()
                .unwrap_or("in-place overwrite not guaranteed")
        );
    }
    println!(
        "{} of {} file(s) securely deleted",
        result.succeeded(),
        result.len()
    );
}

fn setup_logging(level: &str, no_color: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(!no_color)
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path.file_name().context("log file path has no file name")?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_config_writes_loadable_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shredspace.yaml");

        handle_init_config(&path, false).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());

        assert!(handle_init_config(&path, false).is_err());
        handle_init_config(&path, true).unwrap();
    }

    #[test]
    fn directories_need_recursive() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.txt"), b"b").unwrap();

        assert!(collect_targets(&[dir.path().to_path_buf()], false).is_err());
        let mut found = collect_targets(&[dir.path().to_path_buf()], true).unwrap();
        found.sort();
        assert_eq!(found, vec![dir.path().join("a.txt"), dir.path().join("nested/b.txt")]);
    }
}
