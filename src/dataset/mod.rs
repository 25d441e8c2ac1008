//! Dataset descriptors and their row transforms
//!
//! The set of datasets is closed: each variant of [`Dataset`] fixes the
//! expected field count, the progress bar style and the statements produced
//! for every record.

mod collision;
mod weather;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::formats::RawRecord;
use crate::telemetry::BarStyle;

/// A typed value bound into an insertion statement
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Float(Option<f64>),
    Int(Option<i64>),
    Flag(bool),
    Date(Option<NaiveDate>),
    Time(Option<NaiveTime>),
}

/// One table insertion: target table plus ordered bound values
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: &'static str,
    pub values: Vec<Value>,
}

impl Insert {
    pub fn new(table: &'static str, values: Vec<Value>) -> Self {
        Self { table, values }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Weather,
    Collision,
}

impl Dataset {
    pub fn name(self) -> &'static str {
        match self {
            Dataset::Weather => "weather",
            Dataset::Collision => "collision",
        }
    }

    pub fn expected_fields(self) -> usize {
        match self {
            Dataset::Weather => weather::FIELD_COUNT,
            Dataset::Collision => collision::FIELD_COUNT,
        }
    }

    pub fn bar_style(self) -> BarStyle {
        match self {
            Dataset::Weather => BarStyle {
                width: 32,
                precision: -1,
            },
            Dataset::Collision => BarStyle {
                width: 48,
                precision: 1,
            },
        }
    }

    /// Map a validated record to the statements that store it
    pub fn transform(self, record: &RawRecord) -> Vec<Insert> {
        match self {
            Dataset::Weather => weather::transform(record),
            Dataset::Collision => collision::transform(record),
        }
    }
}

/// A dataset category plus the files that hold it
#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
    pub dataset: Dataset,
    pub source_files: Vec<PathBuf>,
}

impl DatasetDescriptor {
    pub fn new(dataset: Dataset, source_files: Vec<PathBuf>) -> Self {
        Self {
            dataset,
            source_files,
        }
    }

    pub fn name(&self) -> &'static str {
        self.dataset.name()
    }
}
