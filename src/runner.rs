//! High-level runner API for the bulk loader.
//!
//! This module provides a simplified public interface that encapsulates the
//! internal setup of run directories, coordinators and workers.
//!
//! This is the primary API for the CLI and for external users.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::warn;

use crate::config::{EXIT_INTERRUPTED, EXIT_WORKER_FAILED};
use crate::coordination::manifest::LocalManifestStorage;
use crate::coordination::{Coordinator, ImportConfigBuilder, ImportReport, SpawnMode, Worker};
use crate::dataset::DatasetDescriptor;

pub use crate::coordination::ImportStatus;
pub use crate::dataset::Dataset;
pub use crate::formats::DelimitedConfig;

/// Arguments for importing one dataset
#[derive(Debug, Clone)]
pub struct ImportArgs {
    pub dataset: Dataset,
    /// Files of the dataset, imported in order
    pub source_files: Vec<PathBuf>,
    pub database_url: String,
    /// Defaults to the number of CPU cores, and is never allowed above it
    pub worker_count: Option<usize>,
    /// Run workers as tasks instead of child processes
    pub in_process: bool,
    pub manifest_dir: Option<PathBuf>,
    /// Keep a temporary run directory even when the import succeeds
    pub keep_manifest: bool,
    pub dialect: DelimitedConfig,
    pub quiet: bool,
}

/// Outcome of one source file
#[derive(Debug)]
pub struct FileSummary {
    pub path: PathBuf,
    pub report: ImportReport,
}

/// Outcome of a dataset import
#[derive(Debug)]
pub struct ImportSummary {
    pub dataset: Dataset,
    /// Files attempted; the import stops at the first file that does not succeed
    pub files: Vec<FileSummary>,
    pub records_loaded: u64,
    pub records_skipped: u64,
    pub duration: Duration,
    /// Path to the preserved run directory (after a failure, or with keep_manifest)
    pub persisted_manifest_dir: Option<PathBuf>,
}

impl ImportSummary {
    /// Status of the last file attempted
    pub fn status(&self) -> ImportStatus {
        self.files
            .last()
            .map_or(ImportStatus::Succeeded, |f| f.report.status.clone())
    }

    pub fn exit_code(&self) -> u8 {
        match self.status() {
            ImportStatus::Succeeded => 0,
            ImportStatus::Failed { .. } => EXIT_WORKER_FAILED,
            ImportStatus::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

/// Arguments for the hidden worker entry point
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub manifest_dir: PathBuf,
    pub job_id: String,
    pub partition_id: u32,
    pub database_url: String,
}

/// Format `n` with a singular or plural unit: `1 line`, `2 lines`
pub fn plural(n: u64, unit: &str, units: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}", n, units)
    }
}

/// Format a duration as `[<h>h][<m>m]<s.sss>s`, leaving out zero hours and minutes
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = (total % 60) as f64 + f64::from(duration.subsec_nanos()) / 1e9;

    let mut out = String::new();
    if hours != 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes != 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{:.3}s", seconds));
    out
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Worker count bounded by the number of CPU cores
fn resolve_worker_count(requested: Option<usize>, cores: usize) -> Result<usize> {
    match requested {
        None => Ok(cores),
        Some(0) => bail!("Worker count must be at least 1"),
        Some(n) if n > cores => {
            warn!(
                requested = n,
                cores, "Worker count exceeds available CPU cores; clamping"
            );
            Ok(cores)
        }
        Some(n) => Ok(n),
    }
}

/// Import every file of a dataset, in order
///
/// Every source file must exist before anything is imported. Files are
/// imported one at a time with a fresh partition plan and progress bar; the
/// import stops at the first file that fails or is interrupted. Rows committed
/// by earlier files, and by partitions of the failing file that committed
/// before the abort, stay in the database.
///
/// # Example
///
/// ```no_run
/// use bulk_loader::runner::{Dataset, DelimitedConfig, ImportArgs, run_import};
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = ImportArgs {
///     dataset: Dataset::Weather,
///     source_files: vec!["datasets/weather.csv".into()],
///     database_url: "postgres://loader@localhost/nyc".to_string(),
///     worker_count: None,
///     in_process: false,
///     manifest_dir: None,
///     keep_manifest: false,
///     dialect: DelimitedConfig::csv(),
///     quiet: false,
/// };
///
/// let summary = run_import(args).await?;
/// println!("Loaded {} records", summary.records_loaded);
/// # Ok(())
/// # }
/// ```
pub async fn run_import(args: ImportArgs) -> Result<ImportSummary> {
    let descriptor = DatasetDescriptor::new(args.dataset, args.source_files.clone());

    for path in &descriptor.source_files {
        if !path.is_file() {
            bail!("Data file \"{}\" does not exist", path.display());
        }
    }

    let worker_count = resolve_worker_count(args.worker_count, available_cores())?;
    let spawn_mode = if args.in_process {
        SpawnMode::InProcess
    } else {
        SpawnMode::current_exe()?
    };

    // Set up manifest directory (use temp dir if not provided)
    let (mut temp_dir, manifest_dir_path) = if let Some(dir) = args.manifest_dir.clone() {
        (None, dir)
    } else {
        let temp_dir = TempDir::new().context("Failed to create run directory")?;
        let path = temp_dir.path().to_path_buf();
        (Some(temp_dir), path)
    };
    let coordinator = Coordinator::new(LocalManifestStorage::new(&manifest_dir_path));

    let say = |line: String| {
        if !args.quiet {
            println!("{}", line);
        }
    };

    say(format!("### Importing {} data ###", descriptor.name()));
    let total_start = Instant::now();
    let mut files = Vec::with_capacity(descriptor.source_files.len());
    let mut lines_processed = 0;

    for path in &descriptor.source_files {
        say(format!("+++ Parsing \"{}\" +++", path.display()));

        let config = ImportConfigBuilder::default()
            .dataset(descriptor.dataset)
            .source_path(path.clone())
            .database_url(args.database_url.clone())
            .worker_count(worker_count)
            .dialect(args.dialect.clone())
            .spawn_mode(spawn_mode.clone())
            .quiet(args.quiet)
            .build()?;
        let report = coordinator.run_import(&config).await?;
        let succeeded = report.succeeded();

        if succeeded {
            say(format!("+++ Finished parsing \"{}\" +++", path.display()));
            say(format!(
                "    (processed {} in {})",
                plural(report.total_records, "line", "lines"),
                format_duration(report.duration)
            ));
            lines_processed += report.total_records;
        }

        files.push(FileSummary {
            path: path.clone(),
            report,
        });
        if !succeeded {
            break;
        }
    }

    let duration = total_start.elapsed();
    let records_loaded = files.iter().map(|f| f.report.records_loaded).sum();
    let records_skipped = files.iter().map(|f| f.report.records_skipped).sum();
    let all_succeeded = files.iter().all(|f| f.report.succeeded());

    if all_succeeded {
        say(format!("### Finished importing {} data ###", descriptor.name()));
        say(format!(
            "    (processed {} from {} in {})",
            plural(lines_processed, "line", "lines"),
            plural(files.len() as u64, "file", "files"),
            format_duration(duration)
        ));
    }

    // Keep the run directory for inspection when something went wrong
    let persisted_manifest_dir = match temp_dir.take() {
        Some(temp) if !all_succeeded || args.keep_manifest => Some(temp.keep()),
        Some(_) => None,
        None if !all_succeeded => Some(manifest_dir_path),
        None => None,
    };

    Ok(ImportSummary {
        dataset: descriptor.dataset,
        files,
        records_loaded,
        records_skipped,
        duration,
        persisted_manifest_dir,
    })
}

/// Load one partition as a child worker process
pub async fn run_worker(args: WorkerArgs) -> Result<()> {
    let worker = Worker::new(
        LocalManifestStorage::new(args.manifest_dir),
        args.job_id,
        args.database_url,
    );
    worker.run(args.partition_id, None).await?;
    Ok(())
}
