use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, end)` into the mapped source file
///
/// Both ends sit immediately after a record delimiter, or on the start of the
/// data region / end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// A partition of the source file assigned to exactly one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub partition_id: u32,
    #[serde(flatten)]
    pub range: ByteRange,
    /// 1-based line number of the first record in the file (the header is line 1)
    pub first_line: u64,
    /// Exact number of records in the range
    pub records: u64,
}

/// Output of the partitioner for one source file
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    /// Data region after the header line
    pub data: ByteRange,
    /// Exact record count of the data region
    pub total_records: u64,
    pub partitions: Vec<Partition>,
}

/// A parsed record whose field count matches the dataset
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub fields: Vec<String>,
}

impl RawRecord {
    /// Accept `fields` only if it has exactly `expected` entries
    pub fn validate(fields: Vec<String>, expected: usize) -> Result<Self, ShapeError> {
        if fields.len() == expected {
            Ok(Self { fields })
        } else {
            Err(ShapeError::FieldCount {
                expected,
                found: fields.len(),
                fields,
            })
        }
    }

    pub fn field(&self, index: usize) -> &str {
        &self.fields[index]
    }
}

/// A record that cannot be transformed because of its shape
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount {
        expected: usize,
        found: usize,
        fields: Vec<String>,
    },
}

/// Partition boundaries could not be placed on record delimiters
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("no record delimiter near offset {ideal} in data region [{start}, {end})")]
    NoDelimiter { ideal: u64, start: u64, end: u64 },
}

/// Configuration for delimited file reading (CSV, TSV, etc.)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub has_header: bool,
    pub quote: u8,
}

impl DelimitedConfig {
    /// Convert delimiter byte to string representation
    pub(crate) fn delimiter_as_string(&self) -> String {
        if self.delimiter == b'\t' {
            "\\t".to_string()
        } else {
            String::from_utf8(vec![self.delimiter])
                .unwrap_or_else(|_| format!("\\x{:02x}", self.delimiter))
        }
    }

    /// Convert quote byte to string representation
    pub(crate) fn quote_as_string(&self) -> String {
        String::from_utf8(vec![self.quote]).unwrap_or_else(|_| format!("\\x{:02x}", self.quote))
    }

    /// Create from string representations
    pub fn from_strings(delimiter: &str, has_header: bool, quote: &str) -> Result<Self> {
        let delimiter_byte = if delimiter == "\\t" {
            b'\t'
        } else if delimiter.len() == 1 {
            delimiter.as_bytes()[0]
        } else {
            anyhow::bail!("Delimiter must be a single character or \\t");
        };

        let quote_byte = if quote.len() == 1 {
            quote.as_bytes()[0]
        } else {
            anyhow::bail!("Quote must be a single character");
        };

        if delimiter_byte == b'\n' || quote_byte == b'\n' {
            anyhow::bail!("Delimiter and quote cannot be the record terminator");
        }
        if delimiter_byte == quote_byte {
            anyhow::bail!("Delimiter and quote must differ");
        }

        Ok(Self {
            delimiter: delimiter_byte,
            has_header,
            quote: quote_byte,
        })
    }

    pub fn csv() -> Self {
        Self::default()
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            has_header: true,
            quote: b'"',
        }
    }
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            quote: b'"',
        }
    }
}
