//! Plot file format constants, header and directory read/write helpers.
//!
//! The header is always the **first 88 bytes** of a plot file:
//!
//! ```text
//! [magic u32][version u16][k u8][tables u8][plot_id 32B][public_key 32B]
//! [checksum u32][park_bytes u32][total_size u64]
//! ```
//!
//! It is followed by the directory: seven table entries of 48 bytes and one
//! positions entry of 24 bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{FormatError, Result};

/// Magic number identifying plot files (ASCII "PLT1").
pub const PLOT_MAGIC: u32 = 0x504C_5431;

pub const FORMAT_VERSION: u16 = 1;

/// Tables 1..=6 hold line points, table 7 holds the sorted root values.
pub const TABLE_COUNT: usize = 7;

pub const HEADER_BYTES: u64 = 88;

/// Widest plot a file may describe; entry values are at most `k + 6` bits.
pub const MAX_PLOT_K: u8 = 32;

/// Byte offset of the crc32 field inside the header.
pub const CHECKSUM_OFFSET: u64 = 72;

pub const TABLE_ENTRY_BYTES: u64 = 48;

pub const POSITIONS_ENTRY_BYTES: u64 = 24;

pub const DIRECTORY_BYTES: u64 = TABLE_ENTRY_BYTES * TABLE_COUNT as u64 + POSITIONS_ENTRY_BYTES;

/// Offset of the first index level, right after header and directory.
pub const DATA_START: u64 = HEADER_BYTES + DIRECTORY_BYTES;

#[derive(Clone, PartialEq, Eq)]
pub struct PlotHeader {
    pub version: u16,
    pub k: u8,
    pub plot_id: [u8; 32],
    pub public_key: [u8; 32],
    /// crc32 of the whole file with this field zeroed.
    pub checksum: u32,
    pub park_bytes: u32,
    pub total_size: u64,
}

impl std::fmt::Debug for PlotHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlotHeader")
            .field("version", &self.version)
            .field("k", &self.k)
            .field("plot_id", &hex(&self.plot_id))
            .field("public_key", &hex(&self.public_key))
            .field("checksum", &format_args!("{:#010x}", self.checksum))
            .field("park_bytes", &self.park_bytes)
            .field("total_size", &self.total_size)
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Writes the 88-byte header.
pub fn write_header<W: Write>(w: &mut W, header: &PlotHeader) -> Result<()> {
    w.write_u32::<LittleEndian>(PLOT_MAGIC)?;
    w.write_u16::<LittleEndian>(header.version)?;
    w.write_u8(header.k)?;
    w.write_u8(TABLE_COUNT as u8)?;
    w.write_all(&header.plot_id)?;
    w.write_all(&header.public_key)?;
    w.write_u32::<LittleEndian>(header.checksum)?;
    w.write_u32::<LittleEndian>(header.park_bytes)?;
    w.write_u64::<LittleEndian>(header.total_size)?;
    Ok(())
}

/// Reads and validates magic, version and table count.
pub fn read_header<R: Read>(r: &mut R) -> Result<PlotHeader> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != PLOT_MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = r.read_u16::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let k = r.read_u8()?;
    let tables = r.read_u8()?;
    if tables as usize != TABLE_COUNT {
        return Err(FormatError::InvalidLayout(format!(
            "expected {TABLE_COUNT} tables, header says {tables}"
        )));
    }
    let mut plot_id = [0u8; 32];
    r.read_exact(&mut plot_id)?;
    let mut public_key = [0u8; 32];
    r.read_exact(&mut public_key)?;
    let checksum = r.read_u32::<LittleEndian>()?;
    let park_bytes = r.read_u32::<LittleEndian>()?;
    let total_size = r.read_u64::<LittleEndian>()?;
    Ok(PlotHeader {
        version,
        k,
        plot_id,
        public_key,
        checksum,
        park_bytes,
        total_size,
    })
}

/// Where one table's index levels and parks live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableEntry {
    pub entries: u64,
    pub park_count: u64,
    pub index_offset: u64,
    pub parks_offset: u64,
    pub stub_bits: u8,
}

/// Where the root table's packed positions live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionsEntry {
    pub offset: u64,
    pub entries: u64,
    pub bits: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Directory {
    pub tables: [TableEntry; TABLE_COUNT],
    pub positions: PositionsEntry,
}

pub fn write_directory<W: Write>(w: &mut W, dir: &Directory) -> Result<()> {
    for t in &dir.tables {
        w.write_u64::<LittleEndian>(t.entries)?;
        w.write_u64::<LittleEndian>(t.park_count)?;
        w.write_u64::<LittleEndian>(t.index_offset)?;
        w.write_u64::<LittleEndian>(t.parks_offset)?;
        w.write_u8(t.stub_bits)?;
        w.write_all(&[0u8; 15])?;
    }
    w.write_u64::<LittleEndian>(dir.positions.offset)?;
    w.write_u64::<LittleEndian>(dir.positions.entries)?;
    w.write_u8(dir.positions.bits)?;
    w.write_all(&[0u8; 7])?;
    Ok(())
}

pub fn read_directory<R: Read>(r: &mut R) -> Result<Directory> {
    let mut dir = Directory::default();
    let mut pad = [0u8; 15];
    for t in dir.tables.iter_mut() {
        t.entries = r.read_u64::<LittleEndian>()?;
        t.park_count = r.read_u64::<LittleEndian>()?;
        t.index_offset = r.read_u64::<LittleEndian>()?;
        t.parks_offset = r.read_u64::<LittleEndian>()?;
        t.stub_bits = r.read_u8()?;
        r.read_exact(&mut pad)?;
    }
    dir.positions.offset = r.read_u64::<LittleEndian>()?;
    dir.positions.entries = r.read_u64::<LittleEndian>()?;
    dir.positions.bits = r.read_u8()?;
    r.read_exact(&mut pad[..7])?;
    Ok(dir)
}
