//! Import coordination: orchestrator, workers and their run directory

pub mod coordinator;
pub mod launcher;
pub mod manifest;
pub mod worker;

pub use coordinator::{
    Coordinator, ImportConfig, ImportConfigBuilder, ImportReport, ImportStatus,
};
pub use launcher::SpawnMode;
pub use worker::Worker;
