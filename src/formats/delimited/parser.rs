use anyhow::{Context, Result};

use crate::formats::reader::DelimitedConfig;

/// Quote-aware field splitter for a single record line
///
/// The line has already been carved out of the mapping, stripped of its
/// carriage return and decoded. Quoted spans may contain the delimiter; a
/// doubled quote inside a quoted span is a literal quote. Fields come back with
/// surrounding quotes and whitespace removed and runs of spaces collapsed to
/// one, and empty fields (leading, between two delimiters, trailing) are kept
/// as empty strings. A bare carriage return inside the line is field data.
pub struct RecordParser {
    builder: csv::ReaderBuilder,
    quote: char,
}

impl RecordParser {
    pub fn new(config: &DelimitedConfig) -> Self {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .has_headers(false)
            .flexible(true)
            .delimiter(config.delimiter)
            .quote(config.quote)
            .trim(csv::Trim::All)
            .terminator(csv::Terminator::Any(b'\n'))
            .buffer_capacity(1024);

        Self {
            builder,
            quote: char::from(config.quote),
        }
    }

    pub fn parse(&self, line: &str) -> Result<Vec<String>> {
        let mut reader = self.builder.from_reader(line.as_bytes());
        let mut record = csv::StringRecord::new();

        let found = reader
            .read_record(&mut record)
            .context("Failed to split record")?;
        if !found {
            // An empty line is a single empty field
            return Ok(vec![String::new()]);
        }

        Ok(record
            .iter()
            .map(|field| collapse_spaces(field.trim_matches(self.quote).trim()))
            .collect())
    }
}

fn collapse_spaces(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut previous_space = false;
    for c in field.chars() {
        if c == ' ' && previous_space {
            continue;
        }
        previous_space = c == ' ';
        out.push(c);
    }
    out
}
