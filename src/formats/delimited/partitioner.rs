use tracing::debug;

use crate::formats::reader::{ByteRange, DelimitedConfig, Partition, PartitionError, PartitionPlan};
use crate::io::{count_records, header_end, nearest_record_boundary};

/// Split the data region of `data` into at most `requested` delimiter-aligned partitions
///
/// The worker count is clamped to the record count so that no partition is
/// empty. Each interior boundary is placed one past the record delimiter
/// nearest to its ideal, evenly spaced offset. When records are so uneven that
/// two ideals resolve to the same delimiter, the duplicate boundary is dropped
/// and the plan has fewer partitions than requested.
pub fn plan_partitions(
    data: &[u8],
    config: &DelimitedConfig,
    requested: usize,
) -> Result<PartitionPlan, PartitionError> {
    if requested == 0 {
        return Err(PartitionError::NoWorkers);
    }

    let start = if config.has_header {
        header_end(data)
    } else {
        0
    };
    let end = data.len() as u64;
    let total_records = count_records(data, start, end);

    let count = (requested as u64).min(total_records);
    let mut boundaries = Vec::with_capacity(count as usize + 1);
    boundaries.push(start);

    let span = end - start;
    for k in 1..count {
        let ideal = start + ((span as u128 * k as u128) / count as u128) as u64;
        let boundary = nearest_record_boundary(data, ideal, start, end)
            .ok_or(PartitionError::NoDelimiter { ideal, start, end })?;
        if boundaries.last().is_some_and(|&last| boundary > last) {
            boundaries.push(boundary);
        }
    }
    if count > 0 {
        boundaries.push(end);
    }

    let mut first_line = if config.has_header { 2 } else { 1 };
    let partitions: Vec<Partition> = boundaries
        .windows(2)
        .enumerate()
        .map(|(idx, pair)| {
            let records = count_records(data, pair[0], pair[1]);
            let partition = Partition {
                partition_id: idx as u32,
                range: ByteRange {
                    start: pair[0],
                    end: pair[1],
                },
                first_line,
                records,
            };
            first_line += records;
            partition
        })
        .collect();

    debug!(
        requested,
        partitions = partitions.len(),
        total_records,
        ?boundaries,
        "Planned partitions"
    );

    Ok(PartitionPlan {
        data: ByteRange { start, end },
        total_records,
        partitions,
    })
}
