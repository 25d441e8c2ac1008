//! Cross-process progress aggregation
//!
//! All workers of one import share a small file-backed memory block holding
//! the loaded counter, the expected total and the last rendered state. Every
//! update happens under a spin lock stored in the same block, and the lock
//! also covers the write of the progress line, so renders from different
//! workers never interleave.
//!
//! Lock order is stdout first, then the block.
//!
//! The lock word holds a token naming the current holder. A worker process
//! killed while holding it never clears it, so a waiter that sees the same
//! token for `LOCK_STALE_AFTER` takes the lock over.

use anyhow::{Context, Result, bail};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

use crate::config::{LOCK_SPIN_LIMIT, LOCK_STALE_AFTER, PROGRESS_BLOCK_SIZE};

// Slot indices into the shared block, one `AtomicU64` each
const LOCK: usize = 0;
const INITIALIZED: usize = 1;
const LOADED: usize = 2;
const TOTAL: usize = 3;
const PERCENT_BITS: usize = 4;
const FILL: usize = 5;
const WIDTH: usize = 6;
const PRECISION: usize = 7;
const RENDER: usize = 8;
const SLOTS: usize = 9;

static NEXT_TICKET: AtomicU32 = AtomicU32::new(1);

/// Lock token unique to one acquisition: process id in the high half
fn lock_token() -> u64 {
    let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
    (u64::from(std::process::id()) << 32) | u64::from(ticket)
}

/// Shape of the rendered bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarStyle {
    /// Number of cells between the brackets
    pub width: u64,
    /// Decimal places the percentage is rounded to; negative rounds to tens,
    /// hundreds, ...
    pub precision: i32,
}

/// Point-in-time view of the shared counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub loaded: u64,
    pub total: u64,
    pub percent: f64,
    pub fill: u64,
}

/// Handle onto the shared progress block
///
/// The orchestrator creates the block once per imported file and every worker
/// attaches to it by path. Handles in different processes (or the same
/// process) observe the same counters.
pub struct ProgressAggregator {
    map: MmapMut,
}

struct BlockGuard<'a> {
    lock: &'a AtomicU64,
    token: u64,
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        // Leaves the word alone if another holder took the lock over
        let _ = self
            .lock
            .compare_exchange(self.token, 0, Ordering::Release, Ordering::Relaxed);
    }
}

impl ProgressAggregator {
    /// Create (or reset) the block at `path` for an import of `total` records
    pub fn create(path: &Path, total: u64, style: BarStyle, render: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create progress block {}", path.display()))?;
        file.set_len(PROGRESS_BLOCK_SIZE)
            .context("Failed to size progress block")?;

        let aggregator = Self::map(&file, path)?;
        aggregator.slot(LOCK).store(0, Ordering::Relaxed);
        aggregator.slot(INITIALIZED).store(0, Ordering::Relaxed);
        aggregator.slot(LOADED).store(0, Ordering::Relaxed);
        aggregator.slot(TOTAL).store(total, Ordering::Relaxed);
        aggregator.slot(PERCENT_BITS).store(0f64.to_bits(), Ordering::Relaxed);
        aggregator.slot(FILL).store(0, Ordering::Relaxed);
        aggregator.slot(WIDTH).store(style.width, Ordering::Relaxed);
        aggregator
            .slot(PRECISION)
            .store(style.precision as i64 as u64, Ordering::Relaxed);
        aggregator
            .slot(RENDER)
            .store(u64::from(render), Ordering::Relaxed);
        aggregator
            .map
            .flush()
            .context("Failed to flush progress block")?;

        Ok(aggregator)
    }

    /// Attach to a block previously created by the orchestrator
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open progress block {}", path.display()))?;
        let len = file
            .metadata()
            .context("Failed to stat progress block")?
            .len();
        if len < PROGRESS_BLOCK_SIZE {
            bail!(
                "Progress block {} is {} bytes, expected {}",
                path.display(),
                len,
                PROGRESS_BLOCK_SIZE
            );
        }
        Self::map(&file, path)
    }

    fn map(file: &std::fs::File, path: &Path) -> Result<Self> {
        // SAFETY: the block is only ever accessed through the atomic slots
        // below, in every process that maps it.
        let map = unsafe { MmapMut::map_mut(file) }
            .with_context(|| format!("Failed to map progress block {}", path.display()))?;
        Ok(Self { map })
    }

    fn slot(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < SLOTS);
        // SAFETY: the mapping is page aligned and PROGRESS_BLOCK_SIZE bytes
        // long, which holds SLOTS u64 values; shared memory is only touched
        // atomically.
        unsafe { &*(self.map.as_ptr() as *const AtomicU64).add(index) }
    }

    fn lock(&self) -> BlockGuard<'_> {
        let lock = self.slot(LOCK);
        let token = lock_token();
        let mut spins = 0u32;
        let mut holder = 0u64;
        let mut held_since = Instant::now();

        loop {
            match lock.compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return BlockGuard { lock, token },
                Err(0) => {}
                Err(current) if current != holder => {
                    holder = current;
                    held_since = Instant::now();
                }
                Err(current) => {
                    if held_since.elapsed() >= LOCK_STALE_AFTER
                        && lock
                            .compare_exchange(current, token, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                    {
                        warn!(
                            holder_pid = current >> 32,
                            "Progress lock holder stopped responding; taking the lock over"
                        );
                        return BlockGuard { lock, token };
                    }
                }
            }

            if spins < LOCK_SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn style(&self) -> BarStyle {
        BarStyle {
            width: self.slot(WIDTH).load(Ordering::Relaxed),
            precision: self.slot(PRECISION).load(Ordering::Relaxed) as i64 as i32,
        }
    }

    fn renders(&self) -> bool {
        self.slot(RENDER).load(Ordering::Relaxed) != 0
    }

    /// Record one finished record and redraw the bar on stdout if it changed
    ///
    /// The first call on a fresh block only draws the zero state.
    pub fn tick(&self) -> std::io::Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.tick_into(&mut out)
    }

    pub fn tick_into<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let _guard = self.lock();
        let style = self.style();

        let first = self.slot(INITIALIZED).swap(1, Ordering::AcqRel) == 0;
        if !first {
            let loaded = self.slot(LOADED).fetch_add(1, Ordering::AcqRel) + 1;
            let total = self.slot(TOTAL).load(Ordering::Relaxed);
            if loaded == total + 1 {
                warn!(
                    loaded,
                    total, "Progress exceeded the record count; partition boundaries are off"
                );
            }

            let portion = if total == 0 {
                1.0
            } else {
                (loaded as f64 / total as f64).min(1.0)
            };
            let percent = round_to(portion * 100.0, style.precision);
            let fill = (portion * style.width as f64).round() as u64;

            let previous = f64::from_bits(self.slot(PERCENT_BITS).load(Ordering::Relaxed));
            if percent == previous && fill == self.slot(FILL).load(Ordering::Relaxed) {
                return Ok(());
            }
            self.slot(PERCENT_BITS)
                .store(percent.to_bits(), Ordering::Relaxed);
            self.slot(FILL).store(fill, Ordering::Relaxed);
        }

        if !self.renders() {
            return Ok(());
        }
        let line = render_line(
            f64::from_bits(self.slot(PERCENT_BITS).load(Ordering::Relaxed)),
            self.slot(FILL).load(Ordering::Relaxed),
            self.slot(LOADED).load(Ordering::Relaxed),
            style,
        );
        out.write_all(line.as_bytes())?;
        out.flush()
    }

    pub fn read(&self) -> ProgressSnapshot {
        let _guard = self.lock();
        ProgressSnapshot {
            loaded: self.slot(LOADED).load(Ordering::Relaxed),
            total: self.slot(TOTAL).load(Ordering::Relaxed),
            percent: f64::from_bits(self.slot(PERCENT_BITS).load(Ordering::Relaxed)),
            fill: self.slot(FILL).load(Ordering::Relaxed),
        }
    }

    /// End the progress line once the import is over
    pub fn finish(&self) -> std::io::Result<()> {
        if !self.renders() {
            return Ok(());
        }
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _guard = self.lock();
        writeln!(out)?;
        out.flush()
    }
}

fn round_to(value: f64, precision: i32) -> f64 {
    let scale = 10f64.powi(precision);
    (value * scale).round() / scale
}

/// `\r<percent>% [<fill><head><spacer>] `
pub fn render_line(percent: f64, fill: u64, loaded: u64, style: BarStyle) -> String {
    let decimals = style.precision.max(0) as usize;
    let width = style.width as usize;
    let fill = (fill as usize).min(width);

    let mut line = format!("\r{:.*}% [", decimals, percent);
    line.push_str(&"=".repeat(fill));
    if fill < width {
        line.push(if loaded == 0 { ' ' } else { '>' });
        line.push_str(&" ".repeat(width - fill - 1));
    }
    line.push_str("] ");
    line
}
