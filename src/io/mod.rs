//! I/O layer: memory-mapped sources and record-boundary scanning

pub mod boundary;
pub mod source_map;

pub use boundary::{count_records, header_end, line_end, nearest_record_boundary};
pub use source_map::SourceMap;
