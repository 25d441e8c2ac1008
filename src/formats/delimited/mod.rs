//! Delimited text: partition planning and record splitting

pub mod parser;
pub mod partitioner;

pub use parser::RecordParser;
pub use partitioner::plan_partitions;
