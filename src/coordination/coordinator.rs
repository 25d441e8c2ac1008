use anyhow::{Context, Result};
use chrono::Utc;
use derive_builder::Builder;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::launcher::{ExitStatus, LaunchContext, SpawnMode, WorkerOutcome, WorkerProcess};
use super::manifest::{
    DelimitedConfigJson, LocalManifestStorage, ManifestFile, PartitionResultFile, PartitionStatus,
};
use crate::dataset::Dataset;
use crate::formats::{DelimitedConfig, PartitionPlan, plan_partitions};
use crate::io::SourceMap;
use crate::telemetry::ProgressAggregator;

/// Configuration for importing one source file
#[derive(Debug, Clone, Builder)]
pub struct ImportConfig {
    pub dataset: Dataset,
    #[builder(setter(into))]
    pub source_path: PathBuf,
    #[builder(setter(into))]
    pub database_url: String,
    /// Requested workers; the partitioner clamps this to the record count
    pub worker_count: usize,
    #[builder(default)]
    pub dialect: DelimitedConfig,
    #[builder(default = "SpawnMode::InProcess")]
    pub spawn_mode: SpawnMode,
    #[builder(default)]
    pub quiet: bool,
}

/// Lifecycle of one import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Init,
    Partitioned,
    Running,
    Succeeded,
    Failed,
}

impl ImportState {
    fn can_advance_to(self, next: ImportState) -> bool {
        use ImportState::*;
        matches!(
            (self, next),
            (Init, Partitioned)
                | (Partitioned, Running)
                | (Partitioned, Succeeded)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }

    fn advance(&mut self, next: ImportState) {
        debug_assert!(self.can_advance_to(next), "{:?} -> {:?}", self, next);
        debug!(from = ?*self, to = ?next, "Import state");
        *self = next;
    }
}

/// How an import ended
#[derive(Debug, Clone, PartialEq)]
pub enum ImportStatus {
    Succeeded,
    /// A worker faulted; partitions that committed before the abort keep their rows
    Failed {
        partition_id: u32,
        diagnostic: String,
    },
    Interrupted,
}

/// Result of an import, successful or not
#[derive(Debug)]
pub struct ImportReport {
    pub job_id: String,
    pub status: ImportStatus,
    pub total_records: u64,
    pub records_loaded: u64,
    pub records_skipped: u64,
    pub partitions_planned: usize,
    /// Partitions whose transaction committed
    pub committed_partitions: Vec<u32>,
    /// Result files written by workers, by partition id
    pub partition_results: Vec<PartitionResultFile>,
    pub duration: Duration,
}

impl ImportReport {
    pub fn succeeded(&self) -> bool {
        self.status == ImportStatus::Succeeded
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, stopping import"),
        _ = terminate => warn!("Received terminate signal, stopping import"),
    }
}

/// The Coordinator partitions a source file, runs one worker per partition and
/// decides whether the import succeeded.
pub struct Coordinator {
    storage: LocalManifestStorage,
}

impl Coordinator {
    pub fn new(storage: LocalManifestStorage) -> Self {
        Self { storage }
    }

    /// Import one file, stopping early on Ctrl+C or SIGTERM
    pub async fn run_import(&self, config: &ImportConfig) -> Result<ImportReport> {
        self.run_import_until(config, interrupt_signal()).await
    }

    /// Import one file, stopping early when `interrupt` resolves
    ///
    /// Errors are reserved for faults before any worker starts (unreadable
    /// source, no delimiter near a split point, run directory I/O). Worker
    /// faults and interruptions are reported through [`ImportReport::status`].
    pub async fn run_import_until<F>(
        &self,
        config: &ImportConfig,
        interrupt: F,
    ) -> Result<ImportReport>
    where
        F: Future<Output = ()>,
    {
        let start_time = Instant::now();
        let mut state = ImportState::Init;

        let job_id = Uuid::new_v4().to_string();
        info!(job_id, source = %config.source_path.display(), "Starting import");

        let source = SourceMap::open(&config.source_path)?;
        let plan = plan_partitions(source.bytes(), &config.dialect, config.worker_count)
            .with_context(|| format!("Failed to partition {}", config.source_path.display()))?;
        info!(
            partitions = plan.partitions.len(),
            total_records = plan.total_records,
            bytes = source.len(),
            "Partitioned source file"
        );

        self.storage.prepare(&job_id).await?;
        let progress_path = self.storage.progress_path(&job_id);
        let progress = ProgressAggregator::create(
            &progress_path,
            plan.total_records,
            config.dataset.bar_style(),
            !config.quiet,
        )?;
        self.write_manifest(&job_id, config, &source, &plan, progress_path)
            .await?;
        state.advance(ImportState::Partitioned);

        if plan.partitions.is_empty() {
            state.advance(ImportState::Succeeded);
            return Ok(ImportReport {
                job_id,
                status: ImportStatus::Succeeded,
                total_records: 0,
                records_loaded: 0,
                records_skipped: 0,
                partitions_planned: 0,
                committed_partitions: Vec::new(),
                partition_results: Vec::new(),
                duration: start_time.elapsed(),
            });
        }

        if let Err(e) = progress.tick() {
            debug!(error = %e, "Failed to draw progress");
        }

        let context = LaunchContext {
            manifest_dir: self.storage.base_dir().to_path_buf(),
            job_id: job_id.clone(),
            database_url: config.database_url.clone(),
            quiet: config.quiet,
            source,
        };
        let mut workers = Vec::with_capacity(plan.partitions.len());
        for partition in &plan.partitions {
            workers.push(WorkerProcess::spawn(
                &config.spawn_mode,
                &context,
                partition.partition_id,
            )?);
        }
        info!("Spawned {} workers", workers.len());
        state.advance(ImportState::Running);

        let ended = Self::wait_for_workers(workers, interrupt).await;

        if let Err(e) = progress.finish() {
            debug!(error = %e, "Failed to end progress line");
        }
        let counters = progress.read();
        debug!(
            loaded = counters.loaded,
            total = counters.total,
            percent = counters.percent,
            "Progress at shutdown"
        );

        let partition_results = self.collect_results(&job_id, &plan).await?;
        let records_loaded = partition_results.iter().map(|r| r.records_loaded).sum();
        let records_skipped = partition_results.iter().map(|r| r.records_skipped).sum();
        let committed_partitions: Vec<u32> = partition_results
            .iter()
            .filter(|r| r.status == PartitionStatus::Committed)
            .map(|r| r.partition_id)
            .collect();

        let status = match ended {
            WaitEnd::Interrupted => ImportStatus::Interrupted,
            WaitEnd::Failed(outcome) => ImportStatus::Failed {
                partition_id: outcome.partition_id,
                diagnostic: Self::diagnostic(&outcome, &partition_results),
            },
            WaitEnd::AllSucceeded => {
                match plan
                    .partitions
                    .iter()
                    .find(|p| !committed_partitions.contains(&p.partition_id))
                {
                    Some(missing) => ImportStatus::Failed {
                        partition_id: missing.partition_id,
                        diagnostic: "worker exited without committing its partition".to_string(),
                    },
                    None => ImportStatus::Succeeded,
                }
            }
        };

        match &status {
            ImportStatus::Succeeded => {
                state.advance(ImportState::Succeeded);
                let accounted = records_loaded + records_skipped;
                if accounted != plan.total_records {
                    warn!(
                        accounted,
                        total_records = plan.total_records,
                        "Processed record count differs from the pre-scan total"
                    );
                }
                info!(
                    job_id,
                    records_loaded,
                    records_skipped,
                    duration_ms = start_time.elapsed().as_millis() as u64,
                    "Import complete"
                );
            }
            ImportStatus::Failed {
                partition_id,
                diagnostic,
            } => {
                state.advance(ImportState::Failed);
                error!(
                    job_id,
                    partition_id,
                    committed = ?committed_partitions,
                    "Import failed: {}",
                    diagnostic
                );
            }
            ImportStatus::Interrupted => {
                state.advance(ImportState::Failed);
                warn!(job_id, committed = ?committed_partitions, "Import interrupted");
            }
        }

        Ok(ImportReport {
            job_id,
            status,
            total_records: plan.total_records,
            records_loaded,
            records_skipped,
            partitions_planned: plan.partitions.len(),
            committed_partitions,
            partition_results,
            duration: start_time.elapsed(),
        })
    }

    async fn write_manifest(
        &self,
        job_id: &str,
        config: &ImportConfig,
        source: &SourceMap,
        plan: &PartitionPlan,
        progress_path: PathBuf,
    ) -> Result<()> {
        let manifest = ManifestFile {
            job_id: job_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            dataset: config.dataset,
            source_path: std::path::absolute(source.path())
                .context("Failed to resolve source path")?,
            source_size: source.len(),
            file_format: DelimitedConfigJson::from(&config.dialect),
            total_records: plan.total_records,
            progress_path,
            partitions: plan.partitions.clone(),
        };

        self.storage
            .write_manifest(&manifest)
            .await
            .context("Failed to write manifest")?;
        debug!(job_id, "Manifest written");
        Ok(())
    }

    /// Wait until every worker succeeds, one fails, or `interrupt` resolves
    ///
    /// Returning drops the remaining workers, which kills their processes or
    /// aborts their tasks.
    async fn wait_for_workers<F>(workers: Vec<WorkerProcess>, interrupt: F) -> WaitEnd
    where
        F: Future<Output = ()>,
    {
        let mut pending: FuturesUnordered<_> = workers
            .into_iter()
            .map(|mut worker| async move { worker.wait().await })
            .collect();
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    None => return WaitEnd::AllSucceeded,
                    Some(outcome) if outcome.exit_status == ExitStatus::Success => {
                        debug!(
                            partition_id = outcome.partition_id,
                            process_id = ?outcome.process_id,
                            "Worker finished"
                        );
                    }
                    Some(outcome) => {
                        if !pending.is_empty() {
                            info!("Stopping {} remaining workers", pending.len());
                        }
                        return WaitEnd::Failed(outcome);
                    }
                },
                _ = &mut interrupt => return WaitEnd::Interrupted,
            }
        }
    }

    /// Read every partition's result file; partitions without one are left out
    async fn collect_results(
        &self,
        job_id: &str,
        plan: &PartitionPlan,
    ) -> Result<Vec<PartitionResultFile>> {
        let mut results = Vec::with_capacity(plan.partitions.len());

        for partition in &plan.partitions {
            match self
                .storage
                .read_result(job_id, partition.partition_id)
                .await?
            {
                Some(result) => results.push(result),
                None => debug!(
                    partition_id = partition.partition_id,
                    "Partition result missing"
                ),
            }
        }

        Ok(results)
    }

    /// Prefer the worker's own failure record, which locates the bad record
    fn diagnostic(outcome: &WorkerOutcome, results: &[PartitionResultFile]) -> String {
        let failure = results
            .iter()
            .find(|r| r.partition_id == outcome.partition_id)
            .and_then(|r| r.failure.as_ref());

        match failure {
            Some(failure) => format!(
                "line {} (byte offset {}): {}",
                failure.line_number, failure.offset, failure.message
            ),
            None => outcome
                .error
                .clone()
                .unwrap_or_else(|| "worker failed without a diagnostic".to_string()),
        }
    }
}

enum WaitEnd {
    AllSucceeded,
    Failed(WorkerOutcome),
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ImportState::*;
        assert!(Init.can_advance_to(Partitioned));
        assert!(Partitioned.can_advance_to(Running));
        assert!(Partitioned.can_advance_to(Succeeded));
        assert!(Running.can_advance_to(Failed));
        assert!(!Init.can_advance_to(Running));
        assert!(!Succeeded.can_advance_to(Failed));
        assert!(!Partitioned.can_advance_to(Failed));
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ImportConfigBuilder::default()
            .dataset(Dataset::Collision)
            .source_path("/data/crashes.csv")
            .database_url("sqlite://loader.db")
            .worker_count(4)
            .build()
            .unwrap();

        assert_eq!(config.spawn_mode, SpawnMode::InProcess);
        assert_eq!(config.dialect, DelimitedConfig::csv());
        assert!(!config.quiet);
    }

    #[test]
    fn test_config_builder_requires_source() {
        assert!(
            ImportConfigBuilder::default()
                .dataset(Dataset::Weather)
                .database_url("sqlite://loader.db")
                .worker_count(1)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_diagnostic_prefers_failure_record() {
        use super::super::manifest::FailureRecord;

        let outcome = WorkerOutcome {
            partition_id: 2,
            process_id: Some(10),
            exit_status: ExitStatus::Failure,
            error: Some("worker process exited with exit status: 1".to_string()),
        };
        assert_eq!(
            Coordinator::diagnostic(&outcome, &[]),
            "worker process exited with exit status: 1"
        );

        let result = PartitionResultFile {
            partition_id: 2,
            worker_pid: 10,
            status: PartitionStatus::Failed,
            records_loaded: 0,
            records_skipped: 0,
            statements_executed: 3,
            bytes_processed: 10,
            started_at: String::new(),
            completed_at: String::new(),
            duration_ms: 1,
            skipped: Vec::new(),
            failure: Some(FailureRecord {
                offset: 120,
                line_number: 7,
                fields: None,
                message: "NOT NULL constraint failed".to_string(),
            }),
        };
        assert_eq!(
            Coordinator::diagnostic(&outcome, &[result]),
            "line 7 (byte offset 120): NOT NULL constraint failed"
        );
    }
}
