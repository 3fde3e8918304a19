//! # BucketSort: bounded-memory external sorting
//!
//! Disk-backed partition-and-sort primitive used by every phase of the plot
//! pipeline.
//!
//! Records are fixed-width and carry a `u64` sort key. During the **write
//! phase** each record is routed by the top `bucket_bits` of its key into a
//! per-bucket buffer; full buffers are appended to that bucket's spill run on
//! disk. During the **read-back phase** every bucket is loaded, sorted in
//! memory (stable, parallel) and handed to the caller in ascending key order.
//! Buckets that do not fit the memory budget are split further by the next
//! key bits before sorting.
//!
//! ## Spill run layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ BLOCK                                         │
//! │ payload_len (u32) | crc32 (u32) | payload     │
//! │ payload = WIDTH-byte records, back to back    │
//! ├───────────────────────────────────────────────┤
//! │ ... repeated for each flushed buffer ...      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Sorted output is usually materialized into a [`TableFile`]: a plain,
//! header-less sequence of fixed-width records addressed by dense position.
//!
//! All integers are little-endian.

mod error;
mod retry;
mod run;
mod sorter;
mod table;

pub use error::SortError;
pub use retry::with_retries;
pub use run::{RunReader, RunWriter};
pub use sorter::{BucketSorter, SortConfig, SortedBuckets, SUB_BUCKET_BITS};
pub use table::{SequentialLookup, TableChunks, TableFile, TableWriter};

use byteorder::{ByteOrder, LittleEndian};

/// A fixed-width record that can be spilled to disk and sorted by key.
///
/// `write_to` and `read_from` always operate on exactly [`Record::WIDTH`]
/// bytes.
pub trait Record: Copy + Send + Sync + 'static {
    /// Encoded size in bytes.
    const WIDTH: usize;

    /// Key the record is bucketed and sorted by.
    fn sort_key(&self) -> u64;

    fn write_to(&self, out: &mut [u8]);

    fn read_from(bytes: &[u8]) -> Self;
}

impl Record for u64 {
    const WIDTH: usize = 8;

    fn sort_key(&self) -> u64 {
        *self
    }

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_u64(out, *self);
    }

    fn read_from(bytes: &[u8]) -> Self {
        LittleEndian::read_u64(bytes)
    }
}

/// Encodes a slice of records into a contiguous byte buffer.
pub fn encode_records<R: Record>(records: &[R]) -> Vec<u8> {
    let mut buf = vec![0u8; records.len() * R::WIDTH];
    for (record, out) in records.iter().zip(buf.chunks_exact_mut(R::WIDTH)) {
        record.write_to(out);
    }
    buf
}

/// Decodes a byte buffer produced by [`encode_records`].
///
/// Trailing bytes that do not form a full record are ignored.
pub fn decode_records<R: Record>(bytes: &[u8]) -> Vec<R> {
    bytes.chunks_exact(R::WIDTH).map(R::read_from).collect()
}
