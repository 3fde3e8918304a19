//! Parks: fixed-size blocks of delta-coded sorted values.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ checkpoint (u64 LE) | count (u16 LE) | delta bit stream    │
//! │ zero padding up to PARK_BYTES                              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! `count` includes the checkpoint. Each delta to the previous value is Rice
//! coded: the quotient `delta >> stub_bits` in unary (ones closed by a zero),
//! then the low `stub_bits` bits. A quotient of [`MAX_UNARY`] or more is
//! written as `MAX_UNARY` ones followed by the raw 64-bit delta, which bounds
//! the worst case at `MAX_UNARY + 64` bits per value.
//!
//! A park is closed as soon as the next delta would not fit, so the number of
//! values per park varies and the level-1 index records each park's first
//! position.

use byteorder::{ByteOrder, LittleEndian};
use std::io::Write;

use crate::bits::{BitReader, BitWriter};
use crate::error::{FormatError, Result};
use crate::index::Checkpoint;

/// Size of every park on disk.
pub const PARK_BYTES: usize = 2048;

/// checkpoint (u64) + count (u16).
pub const PARK_HEADER_BYTES: usize = 8 + 2;

/// Quotients at or above this escape to a raw 64-bit delta.
pub const MAX_UNARY: u64 = 32;

const PARK_PAYLOAD_BITS: usize = (PARK_BYTES - PARK_HEADER_BYTES) * 8;

/// Stub width for a table of `count` values spread over `[0, range)`:
/// `floor(log2(range / count))`, so an average delta costs about
/// `stub_bits + 2` bits.
pub fn stub_bits_for(range: u128, count: u64) -> u8 {
    if count == 0 {
        return 0;
    }
    let mean = range / count as u128;
    if mean <= 1 {
        0
    } else {
        (127 - mean.leading_zeros()).min(56) as u8
    }
}

/// Bits needed to encode `delta` with the given stub width.
pub fn encoded_delta_bits(delta: u64, stub_bits: u8) -> usize {
    let quotient = delta >> stub_bits;
    if quotient < MAX_UNARY {
        quotient as usize + 1 + stub_bits as usize
    } else {
        MAX_UNARY as usize + 64
    }
}

fn encode_delta(bits: &mut BitWriter, delta: u64, stub_bits: u8) {
    let quotient = delta >> stub_bits;
    if quotient < MAX_UNARY {
        bits.write_unary(quotient as usize);
        bits.write(delta, stub_bits as usize);
    } else {
        bits.write(u64::MAX, MAX_UNARY as usize);
        bits.write(delta, 64);
    }
}

fn decode_delta(reader: &mut BitReader<'_>, stub_bits: u8) -> Result<u64> {
    let quotient = reader.read_unary(MAX_UNARY as usize)? as u64;
    if quotient == MAX_UNARY {
        return reader.read(64);
    }
    let stub = reader.read(stub_bits as usize)?;
    Ok((quotient << stub_bits) | stub)
}

/// What a finished park stream looks like, for the index and directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParkSummary {
    pub entries: u64,
    pub stub_bits: u8,
    /// One checkpoint per park, in park order.
    pub checkpoints: Vec<Checkpoint>,
}

impl ParkSummary {
    pub fn park_count(&self) -> u64 {
        self.checkpoints.len() as u64
    }

    pub fn parks_bytes(&self) -> u64 {
        self.park_count() * PARK_BYTES as u64
    }
}

/// Streams sorted values into consecutive parks.
pub struct ParkWriter<W: Write> {
    out: W,
    stub_bits: u8,
    checkpoint: Option<u64>,
    prev: u64,
    count: u16,
    bits: BitWriter,
    entries: u64,
    checkpoints: Vec<Checkpoint>,
}

impl<W: Write> ParkWriter<W> {
    pub fn new(out: W, stub_bits: u8) -> Self {
        Self {
            out,
            stub_bits: stub_bits.min(63),
            checkpoint: None,
            prev: 0,
            count: 0,
            bits: BitWriter::new(),
            entries: 0,
            checkpoints: Vec::new(),
        }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Appends the next value; values must be non-decreasing.
    pub fn push(&mut self, value: u64) -> Result<()> {
        match self.checkpoint {
            None => self.open_park(value),
            Some(_) => {
                if value < self.prev {
                    return Err(FormatError::Unsorted {
                        prev: self.prev,
                        next: value,
                    });
                }
                let delta = value - self.prev;
                let needed = encoded_delta_bits(delta, self.stub_bits);
                if self.bits.bit_len() + needed > PARK_PAYLOAD_BITS || self.count == u16::MAX {
                    self.close_park()?;
                    self.open_park(value);
                } else {
                    encode_delta(&mut self.bits, delta, self.stub_bits);
                    self.count += 1;
                }
            }
        }
        self.prev = value;
        self.entries += 1;
        Ok(())
    }

    fn open_park(&mut self, value: u64) {
        self.checkpoint = Some(value);
        self.count = 1;
        self.checkpoints.push(Checkpoint {
            value,
            position: self.entries,
        });
    }

    fn close_park(&mut self) -> Result<()> {
        let Some(checkpoint) = self.checkpoint.take() else {
            return Ok(());
        };
        let mut park = vec![0u8; PARK_BYTES];
        LittleEndian::write_u64(&mut park[0..8], checkpoint);
        LittleEndian::write_u16(&mut park[8..10], self.count);
        let payload = std::mem::take(&mut self.bits).finish();
        park[PARK_HEADER_BYTES..PARK_HEADER_BYTES + payload.len()].copy_from_slice(&payload);
        self.out.write_all(&park)?;
        self.count = 0;
        Ok(())
    }

    /// Closes the last park and returns the sink with the summary.
    pub fn finish(mut self) -> Result<(W, ParkSummary)> {
        self.close_park()?;
        self.out.flush()?;
        let summary = ParkSummary {
            entries: self.entries,
            stub_bits: self.stub_bits,
            checkpoints: self.checkpoints,
        };
        Ok((self.out, summary))
    }
}

/// Decodes one park.
pub fn decode_park(park: &[u8], stub_bits: u8) -> Result<Vec<u64>> {
    if park.len() < PARK_HEADER_BYTES {
        return Err(FormatError::Corrupt(format!(
            "park of {} bytes is shorter than its header",
            park.len()
        )));
    }
    let checkpoint = LittleEndian::read_u64(&park[0..8]);
    let count = LittleEndian::read_u16(&park[8..10]);
    if count == 0 {
        return Err(FormatError::Corrupt("park with zero entries".into()));
    }

    let mut values = Vec::with_capacity(count as usize);
    values.push(checkpoint);
    let mut reader = BitReader::new(&park[PARK_HEADER_BYTES..]);
    let mut prev = checkpoint;
    for _ in 1..count {
        let delta = decode_delta(&mut reader, stub_bits)?;
        prev = prev
            .checked_add(delta)
            .ok_or_else(|| FormatError::Corrupt("park delta overflows".into()))?;
        values.push(prev);
    }
    Ok(values)
}

/// Encodes a whole sorted slice into parks held in memory.
pub fn encode_parks(values: &[u64], stub_bits: u8) -> Result<(Vec<u8>, ParkSummary)> {
    let mut writer = ParkWriter::new(Vec::new(), stub_bits);
    for &value in values {
        writer.push(value)?;
    }
    writer.finish()
}
