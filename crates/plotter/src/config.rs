//! Run configuration shared by every phase.

use std::path::{Path, PathBuf};
use std::thread;

use bucketsort::SortConfig;

use crate::error::{PlotError, Result};

/// Default memory budget for sorting: 2 GiB.
pub const DEFAULT_MEMORY_BUDGET: usize = 2 << 30;

pub const DEFAULT_BUCKET_BITS: u32 = 7;

pub const DEFAULT_IO_RETRIES: u32 = 3;

/// Smallest budget the sorters can be configured with.
pub const MIN_MEMORY_BUDGET: usize = 16 << 20;

/// Sorters alive at once: the one being drained and the one being filled,
/// plus headroom for resident bucket data.
const CONCURRENT_SORTERS: usize = 4;

const MAX_WRITE_BUFFER: usize = 1 << 20;
const MIN_WRITE_BUFFER: usize = 4 << 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotConfig {
    /// Scratch space; a private subdirectory is created per run and removed
    /// when the run ends.
    pub tmp_dir: PathBuf,
    /// Where `<plot_name>.plot` is written.
    pub out_dir: PathBuf,
    /// Size of the worker pool.
    pub threads: usize,
    /// Buckets per external sort are `2^bucket_bits`.
    pub bucket_bits: u32,
    /// Upper bound on memory used by sort buffers and in-memory buckets.
    pub memory_budget: usize,
    /// Extra attempts for transient read failures.
    pub io_retries: u32,
    /// Re-read the finished file and check its crc before committing it.
    pub verify_after_write: bool,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            tmp_dir: std::env::temp_dir(),
            out_dir: PathBuf::from("."),
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            bucket_bits: DEFAULT_BUCKET_BITS,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            io_retries: DEFAULT_IO_RETRIES,
            verify_after_write: true,
        }
    }
}

impl PlotConfig {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(tmp_dir: P, out_dir: Q) -> Self {
        Self {
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
            out_dir: out_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_bucket_bits(mut self, bucket_bits: u32) -> Self {
        self.bucket_bits = bucket_bits;
        self
    }

    pub fn with_memory_budget(mut self, memory_budget: usize) -> Self {
        self.memory_budget = memory_budget;
        self
    }

    pub fn with_io_retries(mut self, io_retries: u32) -> Self {
        self.io_retries = io_retries;
        self
    }

    pub fn with_verify_after_write(mut self, verify: bool) -> Self {
        self.verify_after_write = verify;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(PlotError::InvalidConfig("threads must be at least 1".into()));
        }
        if self.memory_budget < MIN_MEMORY_BUDGET {
            return Err(PlotError::InvalidConfig(format!(
                "memory budget of {} bytes is below the {} byte minimum",
                self.memory_budget, MIN_MEMORY_BUDGET
            )));
        }
        for (what, dir) in [("tmp_dir", &self.tmp_dir), ("out_dir", &self.out_dir)] {
            if !dir.is_dir() {
                return Err(PlotError::InvalidConfig(format!(
                    "{what} {} is not a directory",
                    dir.display()
                )));
            }
        }
        // The widest key any phase sorts by; narrower keys use fewer buckets.
        self.sort_config(64)
            .validate()
            .map_err(|e| PlotError::InvalidConfig(e.to_string()))
    }

    /// Sort parameters for one external sort over keys of `key_bits` bits.
    pub fn sort_config(&self, key_bits: u32) -> SortConfig {
        let per_sorter = self.memory_budget / CONCURRENT_SORTERS;
        let buckets = 1usize << self.bucket_bits.min(key_bits).min(16);
        let write_buffer = (per_sorter / (2 * buckets)).clamp(MIN_WRITE_BUFFER, MAX_WRITE_BUFFER);
        SortConfig::new(key_bits)
            .with_bucket_bits(self.bucket_bits)
            .with_memory_budget(per_sorter)
            .with_write_buffer_bytes(write_buffer)
            .with_io_retries(self.io_retries)
    }

    /// Bytes one matching batch may keep resident. The sorter being filled
    /// at the same time holds another quarter.
    pub fn match_budget(&self) -> usize {
        self.memory_budget / 2
    }
}
