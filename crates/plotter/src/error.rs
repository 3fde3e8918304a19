//! Error type for the plotting pipeline.

use std::io;

use bucketsort::SortError;
use plotfile::FormatError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlotError>;

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("sort error: {0}")]
    Sort(#[from] SortError),

    #[error("plot format error: {0}")]
    Format(FormatError),

    #[error("k must be in {min}..={max}, got {k}")]
    InvalidK { k: u8, min: u8, max: u8 },

    /// Matching left a table with no entries reachable from the root.
    #[error("table {table} has no surviving entries")]
    EntropyExhausted { table: u8 },

    /// The written plot does not hash to the checksum in its header. The
    /// output file has been discarded.
    #[error("plot checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<FormatError> for PlotError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::ChecksumMismatch { stored, computed } => {
                PlotError::ChecksumMismatch { stored, computed }
            }
            FormatError::Io(e) => PlotError::Io(e),
            other => PlotError::Format(other),
        }
    }
}
