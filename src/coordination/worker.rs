use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info};

use super::manifest::{
    FailureRecord, LocalManifestStorage, PartitionResultFile, PartitionStatus, SkipRecord,
};
use crate::config::MAX_SKIP_DIAGNOSTICS;
use crate::dataset::Dataset;
use crate::db::{Sink, SqlSink};
use crate::formats::{Partition, RawRecord, RecordParser, ShapeError};
use crate::io::{SourceMap, line_end};
use crate::telemetry::ProgressAggregator;

/// A fault that aborts a partition and rolls back its transaction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("partition {partition_id} failed at line {line_number} (byte offset {offset}): {message}")]
pub struct WorkerFault {
    pub partition_id: u32,
    pub offset: u64,
    pub line_number: u64,
    /// Raw fields of the offending record, when it got as far as parsing
    pub fields: Option<Vec<String>>,
    pub message: String,
}

impl From<&WorkerFault> for FailureRecord {
    fn from(fault: &WorkerFault) -> Self {
        Self {
            offset: fault.offset,
            line_number: fault.line_number,
            fields: fault.fields.clone(),
            message: fault.message.clone(),
        }
    }
}

/// Counters accumulated while consuming a partition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionStats {
    pub records_processed: u64,
    pub records_skipped: u64,
    pub statements_executed: u64,
    pub bytes_processed: u64,
    pub skipped: Vec<SkipRecord>,
}

/// Everything needed to consume one partition
pub struct PartitionTask<'a> {
    pub partition: &'a Partition,
    pub data: &'a [u8],
    pub dataset: Dataset,
    pub parser: &'a RecordParser,
    pub progress: &'a ProgressAggregator,
}

impl PartitionTask<'_> {
    fn fault(
        &self,
        offset: u64,
        line_number: u64,
        fields: Option<Vec<String>>,
        message: String,
    ) -> WorkerFault {
        WorkerFault {
            partition_id: self.partition.partition_id,
            offset,
            line_number,
            fields,
            message,
        }
    }

    fn tick(&self) {
        if let Err(e) = self.progress.tick() {
            debug!(error = %e, "Failed to draw progress");
        }
    }
}

/// Consume every record of the partition into `sink` and commit once at the end
///
/// Shape mismatches are skipped and counted. Any other fault drops the sink
/// (rolling back everything this partition inserted) and is returned.
pub async fn process_partition<S: Sink>(
    task: &PartitionTask<'_>,
    mut sink: S,
    stats: &mut PartitionStats,
) -> Result<(), WorkerFault> {
    let range = task.partition.range;
    let expected = task.dataset.expected_fields();
    let mut offset = range.start;
    let mut line_number = task.partition.first_line;

    while offset < range.end {
        let end = line_end(task.data, offset, range.end);
        let mut raw = &task.data[offset as usize..end as usize];
        if let Some(stripped) = raw.strip_suffix(b"\r") {
            raw = stripped;
        }

        let line = std::str::from_utf8(raw).map_err(|e| {
            task.fault(offset, line_number, None, format!("invalid UTF-8: {}", e))
        })?;
        let fields = task
            .parser
            .parse(line)
            .map_err(|e| task.fault(offset, line_number, None, format!("{:#}", e)))?;

        match RawRecord::validate(fields, expected) {
            Ok(record) => {
                for insert in task.dataset.transform(&record) {
                    sink.insert(&insert).await.map_err(|e| {
                        task.fault(
                            offset,
                            line_number,
                            Some(record.fields.clone()),
                            format!("{:#}", e),
                        )
                    })?;
                    stats.statements_executed += 1;
                }
                stats.records_processed += 1;
            }
            Err(ShapeError::FieldCount {
                expected,
                found,
                fields,
            }) => {
                debug!(
                    partition_id = task.partition.partition_id,
                    offset, line_number, expected, found, "Skipping malformed record"
                );
                stats.records_skipped += 1;
                if stats.skipped.len() < MAX_SKIP_DIAGNOSTICS {
                    stats.skipped.push(SkipRecord {
                        offset,
                        line_number,
                        expected,
                        found,
                        fields,
                    });
                }
            }
        }

        task.tick();
        offset = end + 1;
        stats.bytes_processed = offset.min(range.end) - range.start;
        line_number += 1;
    }

    sink.commit().await.map_err(|e| {
        task.fault(
            range.end,
            line_number.saturating_sub(1),
            None,
            format!("{:#}", e),
        )
    })?;

    Ok(())
}

/// Worker that loads one partition of an import described by a manifest
pub struct Worker {
    pub storage: LocalManifestStorage,
    pub job_id: String,
    pub database_url: String,
}

impl Worker {
    pub fn new(
        storage: LocalManifestStorage,
        job_id: impl Into<String>,
        database_url: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            job_id: job_id.into(),
            database_url: database_url.into(),
        }
    }

    /// Process the partition and record its result
    ///
    /// `source` lets an in-process worker reuse the orchestrator's mapping;
    /// otherwise the source file is mapped again and checked against the size
    /// recorded in the manifest. Returns an error if the partition did not
    /// commit; the result file is written either way once the manifest has
    /// been read.
    pub async fn run(
        &self,
        partition_id: u32,
        source: Option<SourceMap>,
    ) -> Result<PartitionResultFile> {
        let manifest = self
            .storage
            .read_manifest(&self.job_id)
            .await
            .context("Failed to read manifest")?;
        let partition = manifest
            .partition(partition_id)
            .with_context(|| format!("Partition {} not found in manifest", partition_id))?
            .clone();

        debug!(
            partition_id,
            start = partition.range.start,
            bytes = partition.range.len(),
            records = partition.records,
            "Loading partition"
        );

        let start_time = Utc::now();
        let start_instant = std::time::Instant::now();
        let mut stats = PartitionStats::default();

        let outcome = self.load(&manifest, &partition, source, &mut stats).await;

        let status = match &outcome {
            Ok(()) => PartitionStatus::Committed,
            Err(_) => PartitionStatus::Failed,
        };
        let failure = match &outcome {
            Ok(()) => None,
            Err(fault) => Some(FailureRecord::from(fault)),
        };

        let result = PartitionResultFile {
            partition_id,
            worker_pid: std::process::id(),
            status,
            records_loaded: if failure.is_none() {
                stats.records_processed
            } else {
                0
            },
            records_skipped: stats.records_skipped,
            statements_executed: stats.statements_executed,
            bytes_processed: stats.bytes_processed,
            started_at: start_time.to_rfc3339(),
            completed_at: Utc::now().to_rfc3339(),
            duration_ms: start_instant.elapsed().as_millis() as u64,
            skipped: stats.skipped,
            failure,
        };

        self.storage
            .write_result(&self.job_id, &result)
            .await
            .context("Failed to write partition result")?;

        match outcome {
            Ok(()) => {
                info!(
                    partition_id,
                    records_loaded = result.records_loaded,
                    records_skipped = result.records_skipped,
                    duration_ms = result.duration_ms,
                    "Partition committed"
                );
                Ok(result)
            }
            Err(fault) => {
                error!(
                    partition_id,
                    offset = fault.offset,
                    line_number = fault.line_number,
                    fields = ?fault.fields,
                    "{}",
                    fault.message
                );
                Err(fault.into())
            }
        }
    }

    async fn load(
        &self,
        manifest: &super::manifest::ManifestFile,
        partition: &Partition,
        source: Option<SourceMap>,
        stats: &mut PartitionStats,
    ) -> Result<(), WorkerFault> {
        let setup_fault = |e: anyhow::Error| WorkerFault {
            partition_id: partition.partition_id,
            offset: partition.range.start,
            line_number: partition.first_line,
            fields: None,
            message: format!("{:#}", e),
        };

        let source = match source {
            Some(source) => source,
            None => SourceMap::open_expecting(&manifest.source_path, manifest.source_size)
                .map_err(setup_fault)?,
        };
        let dialect = manifest.dialect().map_err(setup_fault)?;
        let parser = RecordParser::new(&dialect);
        let progress = ProgressAggregator::attach(&manifest.progress_path).map_err(setup_fault)?;
        let sink = SqlSink::connect(&self.database_url)
            .await
            .map_err(setup_fault)?;

        let task = PartitionTask {
            partition,
            data: source.bytes(),
            dataset: manifest.dataset,
            parser: &parser,
            progress: &progress,
        };
        process_partition(&task, sink, stats).await
    }
}
