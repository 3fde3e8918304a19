//! Error type for reading and writing plot files.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FormatError>;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid plot magic: {0:#x}")]
    BadMagic(u32),

    #[error("unsupported plot format version {0}")]
    UnsupportedVersion(u16),

    #[error("plot file too small: {0} bytes")]
    FileTooSmall(u64),

    #[error("checksum mismatch: header says {stored:#010x}, contents hash to {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// Park input must be non-decreasing.
    #[error("values out of order: {next} after {prev}")]
    Unsorted { prev: u64, next: u64 },

    #[error("bit stream exhausted: wanted {wanted} bits, {available} left")]
    Truncated { wanted: usize, available: usize },

    #[error("no such table: {0}")]
    InvalidTable(u8),

    #[error("position {position} out of range for table {table} with {len} entries")]
    OutOfRange { table: u8, position: u64, len: u64 },

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}
