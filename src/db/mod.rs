//! Database layer - transactional statement sinks

pub mod sink;

pub use sink::{Sink, SqlSink};
