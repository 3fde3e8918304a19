//! Fixed-width records that flow through the external sorts.

use bucketsort::Record;
use byteorder::{ByteOrder, LittleEndian};

/// Forward-pass table entry.
///
/// Table 1 keeps `x` in `meta` and has no back-references. For later tables
/// `left` and `right` are positions in the previous table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub y: u64,
    pub meta: u128,
    pub left: u64,
    pub right: u64,
}

impl Record for Entry {
    const WIDTH: usize = 8 + 16 + 8 + 8;

    fn sort_key(&self) -> u64 {
        self.y
    }

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_u64(&mut out[0..8], self.y);
        LittleEndian::write_u128(&mut out[8..24], self.meta);
        LittleEndian::write_u64(&mut out[24..32], self.left);
        LittleEndian::write_u64(&mut out[32..40], self.right);
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            y: LittleEndian::read_u64(&bytes[0..8]),
            meta: LittleEndian::read_u128(&bytes[8..24]),
            left: LittleEndian::read_u64(&bytes[24..32]),
            right: LittleEndian::read_u64(&bytes[32..40]),
        }
    }
}

/// Entry of a compacted table: metadata dropped, back-references rewritten
/// to dense positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackRef {
    pub y: u64,
    pub left: u64,
    pub right: u64,
}

impl Record for BackRef {
    const WIDTH: usize = 24;

    fn sort_key(&self) -> u64 {
        self.y
    }

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_u64(&mut out[0..8], self.y);
        LittleEndian::write_u64(&mut out[8..16], self.left);
        LittleEndian::write_u64(&mut out[16..24], self.right);
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            y: LittleEndian::read_u64(&bytes[0..8]),
            left: LittleEndian::read_u64(&bytes[8..16]),
            right: LittleEndian::read_u64(&bytes[16..24]),
        }
    }
}

/// Record used by the collation joins, sorted by `key`.
///
/// `origin` is the entry's position in its compacted table; `other` carries
/// whichever value the current join stage still needs; `tag` carries the root
/// value through table 7's joins and is zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinRecord {
    pub key: u64,
    pub other: u64,
    pub origin: u64,
    pub tag: u64,
}

impl Record for JoinRecord {
    const WIDTH: usize = 32;

    fn sort_key(&self) -> u64 {
        self.key
    }

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_u64(&mut out[0..8], self.key);
        LittleEndian::write_u64(&mut out[8..16], self.other);
        LittleEndian::write_u64(&mut out[16..24], self.origin);
        LittleEndian::write_u64(&mut out[24..32], self.tag);
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            key: LittleEndian::read_u64(&bytes[0..8]),
            other: LittleEndian::read_u64(&bytes[8..16]),
            origin: LittleEndian::read_u64(&bytes[16..24]),
            tag: LittleEndian::read_u64(&bytes[24..32]),
        }
    }
}

/// Key width needed to sort values below `limit`.
pub fn key_bits_below(limit: u128) -> u32 {
    if limit <= 2 {
        1
    } else {
        (128 - (limit - 1).leading_zeros()).min(64)
    }
}
