//! Sparse index levels over parks.
//!
//! Level 1 holds one [`Checkpoint`] per park: the park's first value and the
//! table position of that value. Level 2 holds every [`INDEX_FANOUT`]-th
//! level-1 checkpoint and is small enough to keep in memory. A seek is a
//! binary search over level 2, one bounded read of at most `INDEX_FANOUT`
//! level-1 checkpoints, then a linear decode of a single park.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;

use crate::error::Result;

/// Level-1 checkpoints covered by one level-2 checkpoint.
pub const INDEX_FANOUT: u64 = 64;

/// Encoded size of one checkpoint: value (u64) + position (u64).
pub const CHECKPOINT_BYTES: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    /// First value stored in the park.
    pub value: u64,
    /// Table position of that value.
    pub position: u64,
}

impl Checkpoint {
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u64::<LittleEndian>(self.value)?;
        w.write_u64::<LittleEndian>(self.position)?;
        Ok(())
    }

    pub fn decode_all(bytes: &[u8]) -> Vec<Checkpoint> {
        bytes
            .chunks_exact(CHECKPOINT_BYTES as usize)
            .map(|c| Checkpoint {
                value: LittleEndian::read_u64(&c[0..8]),
                position: LittleEndian::read_u64(&c[8..16]),
            })
            .collect()
    }
}

/// Number of level-2 checkpoints for `parks` parks.
pub fn level2_len(parks: u64) -> u64 {
    parks.div_ceil(INDEX_FANOUT)
}

/// On-disk size of both levels for `parks` parks.
pub fn index_bytes(parks: u64) -> u64 {
    (parks + level2_len(parks)) * CHECKPOINT_BYTES
}

/// Every `INDEX_FANOUT`-th checkpoint.
pub fn level2_of(level1: &[Checkpoint]) -> Vec<Checkpoint> {
    level1
        .iter()
        .step_by(INDEX_FANOUT as usize)
        .copied()
        .collect()
}

/// Writes level 1 followed by level 2 and returns the bytes written.
pub fn write_index<W: Write>(w: &mut W, level1: &[Checkpoint]) -> std::io::Result<u64> {
    for checkpoint in level1 {
        checkpoint.write_to(w)?;
    }
    for checkpoint in level2_of(level1) {
        checkpoint.write_to(w)?;
    }
    Ok(index_bytes(level1.len() as u64))
}

/// In-memory level 2 plus the size of level 1, which stays on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLevels {
    parks: u64,
    level2: Vec<Checkpoint>,
}

impl IndexLevels {
    pub fn new(parks: u64, level2: Vec<Checkpoint>) -> Self {
        Self { parks, level2 }
    }

    pub fn parks(&self) -> u64 {
        self.parks
    }

    /// First park that can hold `value`: the park before the first one whose
    /// checkpoint is `>= value`, or park 0.
    ///
    /// `read_level1(start, count)` returns level-1 checkpoints
    /// `start..start + count`.
    pub fn seek_value<F>(&self, value: u64, read_level1: F) -> Result<(u64, Checkpoint)>
    where
        F: FnMut(u64, u64) -> Result<Vec<Checkpoint>>,
    {
        let (below, block) = self.count_below(value, read_level1)?;
        let park = below.saturating_sub(1);
        Ok((park, block.checkpoint(park)))
    }

    /// The park whose position range contains `position`.
    pub fn seek_position<F>(&self, position: u64, mut read_level1: F) -> Result<(u64, Checkpoint)>
    where
        F: FnMut(u64, u64) -> Result<Vec<Checkpoint>>,
    {
        let j = self.level2.partition_point(|c| c.position <= position);
        let block = j.saturating_sub(1) as u64;
        let block = self.load_block(block, &mut read_level1)?;
        let at = block
            .checkpoints
            .partition_point(|c| c.position <= position)
            .saturating_sub(1) as u64;
        let park = block.start + at;
        Ok((park, block.checkpoint(park)))
    }

    /// Number of parks whose checkpoint is `< value`, plus the level-1 block
    /// that was consulted.
    fn count_below<F>(&self, value: u64, mut read_level1: F) -> Result<(u64, Level1Block)>
    where
        F: FnMut(u64, u64) -> Result<Vec<Checkpoint>>,
    {
        let j = self.level2.partition_point(|c| c.value < value) as u64;
        if j == 0 {
            let block = self.load_block(0, &mut read_level1)?;
            return Ok((0, block));
        }
        let block = self.load_block(j - 1, &mut read_level1)?;
        let below = block.start + block.checkpoints.partition_point(|c| c.value < value) as u64;
        Ok((below, block))
    }

    fn load_block<F>(&self, block: u64, read_level1: &mut F) -> Result<Level1Block>
    where
        F: FnMut(u64, u64) -> Result<Vec<Checkpoint>>,
    {
        let start = block * INDEX_FANOUT;
        let count = INDEX_FANOUT.min(self.parks.saturating_sub(start));
        let checkpoints = if count == 0 {
            Vec::new()
        } else {
            read_level1(start, count)?
        };
        Ok(Level1Block { start, checkpoints })
    }
}

struct Level1Block {
    start: u64,
    checkpoints: Vec<Checkpoint>,
}

impl Level1Block {
    fn checkpoint(&self, park: u64) -> Checkpoint {
        park.checked_sub(self.start)
            .and_then(|i| self.checkpoints.get(i as usize))
            .copied()
            .unwrap_or_default()
    }
}
