//! LSB-first bit streams.
//!
//! Bits are packed into bytes starting at the least significant bit; a value
//! written with `n` bits occupies the next `n` stream bits, low bit first.

use crate::error::{FormatError, Result};

#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u64,
    bits_in_current: usize,
    drained: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the low `num_bits` bits of `value` (`num_bits <= 64`).
    pub fn write(&mut self, value: u64, num_bits: usize) {
        debug_assert!(num_bits <= 64);
        let mut value = value;
        let mut remaining = num_bits;

        while remaining > 0 {
            let space = 64 - self.bits_in_current;
            let to_write = remaining.min(space);

            let mask = if to_write >= 64 {
                u64::MAX
            } else {
                (1u64 << to_write) - 1
            };
            self.current |= (value & mask) << self.bits_in_current;
            self.bits_in_current += to_write;

            value = if to_write < 64 { value >> to_write } else { 0 };
            remaining -= to_write;

            while self.bits_in_current >= 8 {
                self.bytes.push(self.current as u8);
                self.current >>= 8;
                self.bits_in_current -= 8;
            }
        }
    }

    pub fn write_u128(&mut self, value: u128, num_bits: usize) {
        debug_assert!(num_bits <= 128);
        let low = num_bits.min(64);
        self.write(value as u64, low);
        if num_bits > 64 {
            self.write((value >> 64) as u64, num_bits - 64);
        }
    }

    /// Appends `count` one bits followed by a zero bit.
    pub fn write_unary(&mut self, count: usize) {
        let mut left = count;
        while left >= 64 {
            self.write(u64::MAX, 64);
            left -= 64;
        }
        self.write((1u64 << left) - 1, left + 1);
    }

    /// Total bits written, including drained ones.
    pub fn bit_len(&self) -> usize {
        (self.drained + self.bytes.len()) * 8 + self.bits_in_current
    }

    /// Takes the complete bytes written so far, keeping the partial byte.
    pub fn drain_bytes(&mut self) -> Vec<u8> {
        self.drained += self.bytes.len();
        std::mem::take(&mut self.bytes)
    }

    /// Flushes the partial byte (zero padded) and returns the remaining bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if self.bits_in_current > 0 {
            self.bytes.push(self.current as u8);
        }
        self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current bit offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() * 8 - self.pos
    }

    pub fn skip(&mut self, num_bits: usize) -> Result<()> {
        self.ensure(num_bits)?;
        self.pos += num_bits;
        Ok(())
    }

    /// Reads `num_bits` bits (`num_bits <= 64`).
    pub fn read(&mut self, num_bits: usize) -> Result<u64> {
        debug_assert!(num_bits <= 64);
        self.ensure(num_bits)?;

        let mut result = 0u64;
        let mut bits_read = 0;
        while bits_read < num_bits {
            let byte = self.bytes[self.pos / 8];
            let bit_pos = self.pos % 8;
            let take = (8 - bit_pos).min(num_bits - bits_read);
            let mask = ((1u16 << take) - 1) as u8;
            let bits = (byte >> bit_pos) & mask;

            result |= (bits as u64) << bits_read;
            bits_read += take;
            self.pos += take;
        }
        Ok(result)
    }

    pub fn read_u128(&mut self, num_bits: usize) -> Result<u128> {
        let low = self.read(num_bits.min(64))? as u128;
        if num_bits > 64 {
            let high = self.read(num_bits - 64)? as u128;
            Ok(low | (high << 64))
        } else {
            Ok(low)
        }
    }

    /// Counts one bits up to a zero bit, stopping early at `max` ones.
    ///
    /// The terminating zero is consumed; when `max` is reached no zero is
    /// expected.
    pub fn read_unary(&mut self, max: usize) -> Result<usize> {
        let mut count = 0;
        while count < max {
            if self.read(1)? == 0 {
                return Ok(count);
            }
            count += 1;
        }
        Ok(count)
    }

    fn ensure(&self, num_bits: usize) -> Result<()> {
        let available = self.remaining();
        if num_bits > available {
            return Err(FormatError::Truncated {
                wanted: num_bits,
                available,
            });
        }
        Ok(())
    }
}

/// Bits needed to store any value below `count` (at least 1).
pub fn bits_for_count(count: u64) -> u8 {
    if count <= 2 {
        1
    } else {
        (64 - (count - 1).leading_zeros()) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_widths_read_back() {
        let mut w = BitWriter::new();
        w.write(0b101, 3);
        w.write(u64::MAX, 64);
        w.write(0, 0);
        w.write(0x1234, 13);
        w.write_u128(u128::MAX - 5, 100);
        w.write_unary(3);
        w.write_unary(70);
        let len = w.bit_len();
        let bytes = w.finish();
        assert_eq!(bytes.len(), len.div_ceil(8));

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read(3).unwrap(), 0b101);
        assert_eq!(r.read(64).unwrap(), u64::MAX);
        assert_eq!(r.read(13).unwrap(), 0x1234 & 0x1FFF);
        assert_eq!(r.read_u128(100).unwrap(), (u128::MAX - 5) & ((1u128 << 100) - 1));
        assert_eq!(r.read_unary(64).unwrap(), 3);
        assert_eq!(r.read_unary(128).unwrap(), 70);
        assert_eq!(r.position(), len);
    }

    #[test]
    fn reading_past_end_is_an_error() {
        let bytes = [0xFFu8];
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read(5).unwrap(), 0x1F);
        assert!(matches!(
            r.read(4),
            Err(FormatError::Truncated {
                wanted: 4,
                available: 3
            })
        ));
    }

    #[test]
    fn unary_stops_at_max() {
        let mut w = BitWriter::new();
        w.write(u64::MAX, 40);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_unary(32).unwrap(), 32);
        assert_eq!(r.position(), 32);
    }

    #[test]
    fn drain_keeps_partial_byte() {
        let mut w = BitWriter::new();
        w.write(0xABC, 12);
        let first = w.drain_bytes();
        assert_eq!(first, vec![0xBC]);
        w.write(0xD, 4);
        assert_eq!(w.bit_len(), 16);
        assert_eq!(w.finish(), vec![0xDA]);
    }

    #[test]
    fn bits_for_count_edges() {
        assert_eq!(bits_for_count(0), 1);
        assert_eq!(bits_for_count(2), 1);
        assert_eq!(bits_for_count(3), 2);
        assert_eq!(bits_for_count(256), 8);
        assert_eq!(bits_for_count(257), 9);
    }
}
