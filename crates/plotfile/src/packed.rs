//! Fixed-width bit-packed arrays, used for the root table's positions.

use std::io::Write;

use crate::bits::{BitReader, BitWriter};
use crate::error::Result;

/// Bytes needed for `entries` values of `bits` bits each.
pub fn packed_bytes(entries: u64, bits: u8) -> u64 {
    (entries * bits as u64).div_ceil(8)
}

/// Byte range `[start, end)` holding entry `index`, and the bit offset of the
/// entry inside the first byte.
pub fn packed_span(index: u64, bits: u8) -> (u64, u64, usize) {
    let first_bit = index * bits as u64;
    let last_bit = first_bit + bits as u64;
    (first_bit / 8, last_bit.div_ceil(8), (first_bit % 8) as usize)
}

/// Decodes one entry from the bytes returned for [`packed_span`].
pub fn unpack_entry(span: &[u8], bit_offset: usize, bits: u8) -> Result<u64> {
    let mut reader = BitReader::new(span);
    reader.skip(bit_offset)?;
    reader.read(bits as usize)
}

pub struct PackedWriter<W: Write> {
    out: W,
    bits: u8,
    writer: BitWriter,
    entries: u64,
}

impl<W: Write> PackedWriter<W> {
    pub fn new(out: W, bits: u8) -> Self {
        Self {
            out,
            bits,
            writer: BitWriter::new(),
            entries: 0,
        }
    }

    pub fn push(&mut self, value: u64) -> Result<()> {
        debug_assert!(self.bits == 64 || value >> self.bits == 0);
        self.writer.write(value, self.bits as usize);
        self.entries += 1;
        if self.entries % 4096 == 0 {
            let bytes = self.writer.drain_bytes();
            self.out.write_all(&bytes)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn finish(mut self) -> Result<(W, u64)> {
        let tail = self.writer.finish();
        self.out.write_all(&tail)?;
        self.out.flush()?;
        Ok((self.out, self.entries))
    }
}
