use bulk_loader::runner::{
    Dataset, DelimitedConfig, ImportArgs, ImportStatus, ImportSummary, WorkerArgs, run_import,
    run_worker,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Clone)]
#[command(version, about = "Bulk-load delimited datasets with parallel workers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Import the files of one dataset
    Import {
        /// Dataset the files belong to
        #[arg(short, long, value_enum)]
        dataset: Dataset,

        /// Data files, imported in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Database URL (postgres://... or sqlite://...)
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,

        /// Number of workers (default: number of CPU cores)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Run workers as tasks in this process instead of child processes
        #[arg(long)]
        in_process: bool,

        /// Field delimiter (a single character, or \t)
        #[arg(long, default_value = ",")]
        delimiter: String,

        /// Quote character
        #[arg(long, default_value = "\"")]
        quote: String,

        /// Directory for run files (default: system temp directory)
        #[arg(long)]
        manifest_dir: Option<PathBuf>,

        /// Keep the temporary run directory even if the import succeeds
        #[arg(long)]
        keep_manifest: bool,

        /// Quiet mode - no progress bar or banners, warnings and errors only
        #[arg(short, long)]
        quiet: bool,
    },

    /// Load a single partition (started by `import`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        manifest_dir: PathBuf,

        #[arg(long)]
        job_id: String,

        #[arg(long)]
        partition: u32,

        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,

        #[arg(short, long)]
        quiet: bool,
    },
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("bulk_loader=warn,sqlx=off")
    } else {
        EnvFilter::new("bulk_loader=info,sqlx=off")
    };
    // Progress is drawn on stdout; logs must stay off it
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Import {
            dataset,
            files,
            database_url,
            workers,
            in_process,
            delimiter,
            quote,
            manifest_dir,
            keep_manifest,
            quiet,
        } => {
            init_tracing(quiet);

            let dialect = match DelimitedConfig::from_strings(&delimiter, true, &quote) {
                Ok(dialect) => dialect,
                Err(e) => {
                    eprintln!("ERROR: {:#}", e);
                    return ExitCode::FAILURE;
                }
            };

            let import_args = ImportArgs {
                dataset,
                source_files: files,
                database_url,
                worker_count: workers,
                in_process,
                manifest_dir,
                keep_manifest,
                dialect,
                quiet,
            };

            match run_import(import_args).await {
                Ok(summary) => {
                    report(&summary);
                    ExitCode::from(summary.exit_code())
                }
                Err(e) => {
                    eprintln!("ERROR: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Worker {
            manifest_dir,
            job_id,
            partition,
            database_url,
            quiet,
        } => {
            init_tracing(quiet);

            let worker_args = WorkerArgs {
                manifest_dir,
                job_id,
                partition_id: partition,
                database_url,
            };
            match run_worker(worker_args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(partition_id = partition, "Worker failed: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Terminal report for an import that did not fully succeed
fn report(summary: &ImportSummary) {
    let Some(last) = summary.files.last() else {
        return;
    };

    match &last.report.status {
        ImportStatus::Succeeded => {}
        ImportStatus::Failed {
            partition_id,
            diagnostic,
        } => {
            eprintln!(
                "ERROR: importing \"{}\" failed in partition {}: {}",
                last.path.display(),
                partition_id,
                diagnostic
            );
            if !last.report.committed_partitions.is_empty() {
                eprintln!(
                    "Partitions {:?} had already committed; their rows remain in the database.",
                    last.report.committed_partitions
                );
            }
        }
        ImportStatus::Interrupted => {
            eprintln!("Import of \"{}\" was interrupted.", last.path.display());
            if !last.report.committed_partitions.is_empty() {
                eprintln!(
                    "Partitions {:?} had already committed; their rows remain in the database.",
                    last.report.committed_partitions
                );
            }
        }
    }

    if let Some(ref persisted_path) = summary.persisted_manifest_dir {
        eprintln!();
        eprintln!("Run directory preserved for inspection:");
        eprintln!(
            "  {}/jobs/{}/partitions/",
            persisted_path.display(),
            last.report.job_id
        );
    }
}
