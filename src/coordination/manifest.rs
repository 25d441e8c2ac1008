use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::dataset::Dataset;
use crate::formats::{DelimitedConfig, Partition};

/// Helper struct for JSON serialization of DelimitedConfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelimitedConfigJson {
    delimiter: String,
    has_header: bool,
    quote: String,
}

impl From<&DelimitedConfig> for DelimitedConfigJson {
    fn from(config: &DelimitedConfig) -> Self {
        Self {
            delimiter: config.delimiter_as_string(),
            has_header: config.has_header,
            quote: config.quote_as_string(),
        }
    }
}

impl TryFrom<DelimitedConfigJson> for DelimitedConfig {
    type Error = anyhow::Error;

    fn try_from(json: DelimitedConfigJson) -> Result<Self> {
        DelimitedConfig::from_strings(&json.delimiter, json.has_header, &json.quote)
    }
}

/// The manifest file structure written by the orchestrator
///
/// Everything a worker needs to process its partition without talking to the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub job_id: String,
    pub created_at: String, // ISO 8601
    pub dataset: Dataset,
    pub source_path: PathBuf,
    pub source_size: u64,
    pub file_format: DelimitedConfigJson,
    pub total_records: u64,
    pub progress_path: PathBuf,
    pub partitions: Vec<Partition>,
}

impl ManifestFile {
    pub fn dialect(&self) -> Result<DelimitedConfig> {
        DelimitedConfig::try_from(self.file_format.clone())
    }

    pub fn partition(&self, partition_id: u32) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.partition_id == partition_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    Committed,
    Failed,
}

/// The result file structure written by workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionResultFile {
    pub partition_id: u32,
    pub worker_pid: u32,
    pub status: PartitionStatus,
    /// Records whose statements were committed; zero unless committed
    pub records_loaded: u64,
    pub records_skipped: u64,
    pub statements_executed: u64,
    pub bytes_processed: u64,
    pub started_at: String,   // ISO 8601
    pub completed_at: String, // ISO 8601
    pub duration_ms: u64,
    /// First skipped records of the partition, in file order
    pub skipped: Vec<SkipRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

/// A record left out because its shape did not match the dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub offset: u64,
    pub line_number: u64,
    pub expected: usize,
    pub found: usize,
    pub fields: Vec<String>,
}

/// Diagnostic for the fault that aborted a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub offset: u64,
    pub line_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    pub message: String,
}

/// Local filesystem storage for one import's run directory
///
/// Directory structure:
///   {base_dir}/jobs/{job_id}/manifest.json
///   {base_dir}/jobs/{job_id}/progress.bin
///   {base_dir}/jobs/{job_id}/partitions/{partition_id:04}.result
pub struct LocalManifestStorage {
    base_dir: PathBuf,
}

impl LocalManifestStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.base_dir.join("jobs").join(job_id)
    }

    fn partitions_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("partitions")
    }

    fn manifest_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("manifest.json")
    }

    pub fn progress_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("progress.bin")
    }

    fn result_path(&self, job_id: &str, partition_id: u32) -> PathBuf {
        self.partitions_dir(job_id)
            .join(format!("{:04}.result", partition_id))
    }

    /// Create the job directory tree
    pub async fn prepare(&self, job_id: &str) -> Result<()> {
        fs::create_dir_all(self.partitions_dir(job_id))
            .await
            .context("Failed to create job directory")
    }

    pub async fn write_manifest(&self, manifest: &ManifestFile) -> Result<()> {
        let manifest_path = self.manifest_path(&manifest.job_id);

        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create manifest directory")?;
        }

        let json =
            serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;

        fs::write(&manifest_path, json)
            .await
            .context("Failed to write manifest file")?;

        fs::create_dir_all(self.partitions_dir(&manifest.job_id))
            .await
            .context("Failed to create partitions directory")?;

        Ok(())
    }

    pub async fn read_manifest(&self, job_id: &str) -> Result<ManifestFile> {
        let manifest_path = self.manifest_path(job_id);

        let contents = fs::read_to_string(&manifest_path)
            .await
            .with_context(|| format!("Failed to read manifest file {}", manifest_path.display()))?;

        let manifest: ManifestFile =
            serde_json::from_str(&contents).context("Failed to parse manifest file")?;

        Ok(manifest)
    }

    /// Write a partition result; the file appears atomically under its final name
    pub async fn write_result(&self, job_id: &str, result: &PartitionResultFile) -> Result<()> {
        let result_path = self.result_path(job_id, result.partition_id);
        let staging_path = result_path.with_extension("result.tmp");

        let json = serde_json::to_string_pretty(result).context("Failed to serialize result")?;

        fs::write(&staging_path, json)
            .await
            .context("Failed to write result file")?;
        fs::rename(&staging_path, &result_path)
            .await
            .context("Failed to publish result file")?;

        Ok(())
    }

    /// Read a partition result, `None` if the worker never wrote one
    pub async fn read_result(
        &self,
        job_id: &str,
        partition_id: u32,
    ) -> Result<Option<PartitionResultFile>> {
        let result_path = self.result_path(job_id, partition_id);

        let contents = match fs::read_to_string(&result_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read result file"),
        };

        let result: PartitionResultFile =
            serde_json::from_str(&contents).context("Failed to parse result file")?;

        Ok(Some(result))
    }
}
