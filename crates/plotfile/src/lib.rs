//! # PlotFile: compressed plot file format
//!
//! Write-once, read-many files holding the seven compressed proof tables of a
//! plot. Tables 1..=6 store sorted line points, table 7 stores the sorted
//! root values; all seven use the same park encoding. A bit-packed positions
//! array links each root entry back to its table-6 line point.
//!
//! ## File layout (v1)
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ HEADER (88 bytes)                             │
//! │ magic "PLT1" | version | k | tables           │
//! │ plot_id | public_key | crc32 | park_bytes     │
//! │ total_size                                    │
//! ├───────────────────────────────────────────────┤
//! │ DIRECTORY                                     │
//! │ 7 × entries | parks | index_off | parks_off   │
//! │     | stub_bits                               │
//! │ positions_off | positions | bits              │
//! ├───────────────────────────────────────────────┤
//! │ INDEX (per table)                             │
//! │ level 1: (first value, position) per park     │
//! │ level 2: every 64th level-1 checkpoint        │
//! ├───────────────────────────────────────────────┤
//! │ PARKS (per table, 2048 bytes each)            │
//! │ checkpoint u64 | count u16 | Rice deltas      │
//! ├───────────────────────────────────────────────┤
//! │ POSITIONS (bit-packed, fixed width)           │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The crc32 covers the whole file with its
//! own field zeroed.

pub mod bits;
mod error;
mod format;
pub mod index;
mod line_point;
pub mod packed;
pub mod park;
mod reader;
mod writer;

pub use bits::{bits_for_count, BitReader, BitWriter};
pub use error::{FormatError, Result};
pub use format::{
    read_directory, read_header, write_directory, write_header, Directory, PlotHeader,
    PositionsEntry, TableEntry, CHECKSUM_OFFSET, DATA_START, FORMAT_VERSION, HEADER_BYTES,
    MAX_PLOT_K, PLOT_MAGIC, TABLE_COUNT,
};
pub use index::{Checkpoint, INDEX_FANOUT};
pub use line_point::{line_point_to_square, square_to_line_point};
pub use packed::PackedWriter;
pub use park::{stub_bits_for, ParkSummary, ParkWriter, PARK_BYTES};
pub use reader::PlotReader;
pub use writer::{layout, PlotContents, PlotWriter, PositionsSource, TableSource};
