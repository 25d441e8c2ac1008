//! Configuration constants for the bulk loader
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Sink Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// Timeout for a single INSERT statement
///
/// Rows are inserted one statement at a time inside a long-running
/// transaction, so a statement that takes this long is stuck rather than slow.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(180); // 3 minutes

/// How long a SQLite connection waits for another worker's write lock
///
/// Each worker holds its write transaction until its whole partition is
/// consumed, so this has to cover the duration of a sibling's partition.
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(600);

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

// ============================================================================
// Worker Configuration
// ============================================================================

/// Skip diagnostics kept per partition result; the count is always exact.
pub const MAX_SKIP_DIAGNOSTICS: usize = 100;

/// Record terminator used for partitioning and line carving
pub const RECORD_DELIMITER: u8 = b'\n';

// ============================================================================
// Progress Configuration
// ============================================================================

/// Size of the file-backed block shared by every worker of one import
pub const PROGRESS_BLOCK_SIZE: u64 = 128;

/// Busy-wait iterations on the progress lock before yielding the thread
pub const LOCK_SPIN_LIMIT: u32 = 64;

/// How long one holder may keep the progress lock before a waiter takes it over
///
/// The lock covers one counter update and one line write. A holder past this
/// was killed mid-update.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(1);

// ============================================================================
// Process Exit Codes
// ============================================================================

pub const EXIT_WORKER_FAILED: u8 = 1;

pub const EXIT_INTERRUPTED: u8 = 2;
