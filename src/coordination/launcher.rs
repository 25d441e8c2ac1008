//! Worker launching: re-executed child processes or in-process tasks
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::manifest::{LocalManifestStorage, PartitionResultFile};
use super::worker::Worker;
use crate::config::DATABASE_URL_ENV;
use crate::io::SourceMap;

/// How workers are started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnMode {
    /// Re-execute `executable` with the hidden `worker` subcommand
    Process { executable: PathBuf },
    /// Run workers as tasks on the current runtime
    InProcess,
}

impl SpawnMode {
    /// Re-execute the running binary
    pub fn current_exe() -> Result<Self> {
        let executable =
            std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(SpawnMode::Process { executable })
    }
}

/// What a worker needs to find its partition
#[derive(Clone)]
pub struct LaunchContext {
    pub manifest_dir: PathBuf,
    pub job_id: String,
    pub database_url: String,
    pub quiet: bool,
    /// Mapping shared with in-process workers
    pub source: SourceMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

/// How one worker ended
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub partition_id: u32,
    /// OS process id, `None` for in-process workers
    pub process_id: Option<u32>,
    pub exit_status: ExitStatus,
    pub error: Option<String>,
}

enum Handle {
    Child(Child),
    Task(JoinHandle<Result<PartitionResultFile>>),
}

/// A running worker; dropping it kills the process or aborts the task
pub struct WorkerProcess {
    partition_id: u32,
    process_id: Option<u32>,
    handle: Handle,
}

impl WorkerProcess {
    pub fn spawn(mode: &SpawnMode, context: &LaunchContext, partition_id: u32) -> Result<Self> {
        match mode {
            SpawnMode::Process { executable } => {
                let mut command = Command::new(executable);
                command
                    .arg("worker")
                    .arg("--manifest-dir")
                    .arg(&context.manifest_dir)
                    .arg("--job-id")
                    .arg(&context.job_id)
                    .arg("--partition")
                    .arg(partition_id.to_string());
                if context.quiet {
                    command.arg("--quiet");
                }
                command
                    .env(DATABASE_URL_ENV, &context.database_url)
                    .stdin(Stdio::null())
                    .kill_on_drop(true);

                let child = command.spawn().with_context(|| {
                    format!(
                        "Failed to spawn worker process {} for partition {}",
                        executable.display(),
                        partition_id
                    )
                })?;

                Ok(Self {
                    partition_id,
                    process_id: child.id(),
                    handle: Handle::Child(child),
                })
            }
            SpawnMode::InProcess => {
                let worker = Worker::new(
                    LocalManifestStorage::new(&context.manifest_dir),
                    context.job_id.clone(),
                    context.database_url.clone(),
                );
                let source = context.source.clone();
                let task =
                    tokio::spawn(async move { worker.run(partition_id, Some(source)).await });

                Ok(Self {
                    partition_id,
                    process_id: None,
                    handle: Handle::Task(task),
                })
            }
        }
    }

    /// Wait for the worker to end
    pub async fn wait(&mut self) -> WorkerOutcome {
        let (exit_status, error) = match &mut self.handle {
            Handle::Child(child) => match child.wait().await {
                Ok(status) if status.success() => (ExitStatus::Success, None),
                Ok(status) => (
                    ExitStatus::Failure,
                    Some(format!("worker process exited with {}", status)),
                ),
                Err(e) => (
                    ExitStatus::Failure,
                    Some(format!("failed to wait for worker process: {}", e)),
                ),
            },
            Handle::Task(task) => match task.await {
                Ok(Ok(_)) => (ExitStatus::Success, None),
                Ok(Err(e)) => (ExitStatus::Failure, Some(format!("{:#}", e))),
                Err(e) => (
                    ExitStatus::Failure,
                    Some(format!("worker task panicked: {}", e)),
                ),
            },
        };

        WorkerOutcome {
            partition_id: self.partition_id,
            process_id: self.process_id,
            exit_status,
            error,
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Children are killed through kill_on_drop
        if let Handle::Task(task) = &self.handle {
            task.abort();
        }
    }
}
