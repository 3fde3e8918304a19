use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SortError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A spill block failed its crc check.
    #[error("corrupt block at offset {offset} in {}", path.display())]
    Corrupt { path: PathBuf, offset: u64 },

    #[error("key {key:#x} does not fit in {key_bits} bits")]
    KeyOutOfRange { key: u64, key_bits: u32 },

    /// A bucket still exceeds the memory budget after all key bits were used
    /// for sub-bucketing. The size parameter or the budget has to change.
    #[error("bucket {bucket} holds {bytes} bytes, memory budget is {budget} bytes")]
    BucketTooLarge {
        bucket: usize,
        bytes: u64,
        budget: usize,
    },

    #[error("invalid sort config: {0}")]
    InvalidConfig(String),

    #[error("position {position} out of range for table of {len} records")]
    OutOfRange { position: u64, len: u64 },
}

impl SortError {
    /// Errors worth re-reading the same data for.
    pub fn is_transient(&self) -> bool {
        match self {
            SortError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::UnexpectedEof
            ),
            SortError::Corrupt { .. } => true,
            _ => false,
        }
    }
}
