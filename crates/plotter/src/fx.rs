//! Functions for tables 2..=7.
//!
//! The hash input is the table number, the left `y` and both metadata values
//! packed LSB-first. The output `y` is the first `k + PARAM_EXT` bits of the
//! BLAKE3 hash (`k` bits for table 7). Tables 2 and 3 carry the concatenated
//! input metadata forward; later tables take their metadata from the hash bits
//! after `y`.

use plotfile::{BitReader, BitWriter};

use crate::error::Result;
use crate::matcher::PARAM_EXT;

/// Metadata width of each table in multiples of `k`, indexed by table number.
pub const META_MULTIPLIERS: [usize; 8] = [0, 1, 2, 4, 4, 3, 2, 0];

pub fn meta_bits(k: u8, table: u8) -> usize {
    META_MULTIPLIERS[table as usize] * k as usize
}

pub fn y_bits(k: u8, table: u8) -> u32 {
    if table == 7 {
        k as u32
    } else {
        k as u32 + PARAM_EXT as u32
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FxCalculator {
    k: u8,
    table: u8,
    in_meta_bits: usize,
    out_meta_bits: usize,
    out_y_bits: usize,
}

impl FxCalculator {
    /// `table` is the table being computed, 2..=7.
    pub fn new(k: u8, table: u8) -> Self {
        debug_assert!((2..=7).contains(&table));
        Self {
            k,
            table,
            in_meta_bits: meta_bits(k, table - 1),
            out_meta_bits: meta_bits(k, table),
            out_y_bits: y_bits(k, table) as usize,
        }
    }

    pub fn table(&self) -> u8 {
        self.table
    }

    /// Output `(y, meta)` for a matched pair.
    pub fn evaluate(&self, y_l: u64, meta_l: u128, meta_r: u128) -> Result<(u64, u128)> {
        let mut input = BitWriter::new();
        input.write(self.table as u64, 8);
        input.write(y_l, self.k as usize + PARAM_EXT as usize);
        input.write_u128(meta_l, self.in_meta_bits);
        input.write_u128(meta_r, self.in_meta_bits);
        let hash = blake3::hash(&input.finish());

        let mut output = BitReader::new(hash.as_bytes());
        let y = output.read(self.out_y_bits)?;
        let meta = match self.table {
            2 | 3 => (meta_l << self.in_meta_bits) | meta_r,
            _ => output.read_u128(self.out_meta_bits)?,
        };
        Ok((y, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_per_table() {
        assert_eq!(meta_bits(32, 3), 128);
        assert_eq!(meta_bits(20, 7), 0);
        assert_eq!(y_bits(20, 6), 26);
        assert_eq!(y_bits(20, 7), 20);
    }

    #[test]
    fn outputs_fit_their_widths() -> anyhow::Result<()> {
        let k = 18u8;
        for table in 2..=7u8 {
            let fx = FxCalculator::new(k, table);
            let in_mask = (1u128 << meta_bits(k, table - 1)) - 1;
            for i in 0..200u64 {
                let (y, meta) = fx.evaluate(i * 12_345, (i as u128 * 99) & in_mask, 7 & in_mask)?;
                assert!(y < 1 << y_bits(k, table), "table {table}");
                let out_bits = meta_bits(k, table);
                assert!(out_bits == 128 || meta < 1u128 << out_bits, "table {table}");
            }
        }
        Ok(())
    }

    #[test]
    fn early_tables_concatenate_metadata() -> anyhow::Result<()> {
        let k = 16u8;
        let (_, meta) = FxCalculator::new(k, 2).evaluate(5, 0xAAAA, 0x5555)?;
        assert_eq!(meta, 0xAAAA_5555);
        let (_, meta) = FxCalculator::new(k, 3).evaluate(5, 0x1111_2222, 0x3333_4444)?;
        assert_eq!(meta, 0x1111_2222_3333_4444);
        Ok(())
    }

    #[test]
    fn deterministic_and_order_sensitive() -> anyhow::Result<()> {
        let fx = FxCalculator::new(20, 4);
        let a = fx.evaluate(77, 1, 2)?;
        assert_eq!(a, fx.evaluate(77, 1, 2)?);
        assert_ne!(a, fx.evaluate(77, 2, 1)?);
        Ok(())
    }
}
