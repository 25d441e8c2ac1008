//! Record-boundary scanning over a mapped byte region

use crate::config::RECORD_DELIMITER;

/// Offset of the first byte after the header line
///
/// A file without any delimiter is all header and has no records.
pub fn header_end(data: &[u8]) -> u64 {
    data.iter()
        .position(|&b| b == RECORD_DELIMITER)
        .map_or(data.len(), |pos| pos + 1) as u64
}

/// Exact number of records in `[start, end)`
///
/// Every delimiter terminates one record; a trailing line without a delimiter
/// is one more record. An empty trailing line is not counted.
pub fn count_records(data: &[u8], start: u64, end: u64) -> u64 {
    if start >= end {
        return 0;
    }
    let region = &data[start as usize..end as usize];
    let delimiters = region.iter().filter(|&&b| b == RECORD_DELIMITER).count() as u64;
    match region.last() {
        Some(&last) if last != RECORD_DELIMITER => delimiters + 1,
        _ => delimiters,
    }
}

/// Offset of the end of the record starting at `start`, excluding the delimiter
pub fn line_end(data: &[u8], start: u64, end: u64) -> u64 {
    data[start as usize..end as usize]
        .iter()
        .position(|&b| b == RECORD_DELIMITER)
        .map_or(end, |pos| start + pos as u64)
}

/// Find the record boundary nearest to `ideal` that lies strictly inside `(lo, hi)`
///
/// Searches outward from `ideal`, alternating forward and backward one byte at a
/// time, and returns the offset one past the first delimiter found. Returns
/// `None` when the region holds no usable delimiter.
pub fn nearest_record_boundary(data: &[u8], ideal: u64, lo: u64, hi: u64) -> Option<u64> {
    let mut forward = ideal;
    let mut backward = ideal;

    loop {
        let can_forward = forward + 1 < hi;
        let can_backward = backward > lo;
        if !can_forward && !can_backward {
            return None;
        }

        if can_forward {
            if data[forward as usize] == RECORD_DELIMITER {
                return Some(forward + 1);
            }
            forward += 1;
        }

        if can_backward {
            backward -= 1;
            if data[backward as usize] == RECORD_DELIMITER {
                return Some(backward + 1);
            }
        }
    }
}
