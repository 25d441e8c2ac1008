//! File format parsers and readers

pub mod coerce;
pub mod delimited;
pub mod reader;

pub use delimited::{RecordParser, plan_partitions};
pub use reader::{DelimitedConfig, Partition, PartitionPlan, RawRecord, ShapeError};
