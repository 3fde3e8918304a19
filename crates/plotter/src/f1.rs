//! Table 1 function.
//!
//! `f1(x)` takes `k` bits at offset `x * k` of a BLAKE3 output stream keyed by
//! the plot id and appends the top [`PARAM_EXT`] bits of `x`, giving a
//! `k + PARAM_EXT` bit value.

use plotfile::BitReader;

use crate::error::Result;
use crate::matcher::PARAM_EXT;

#[derive(Clone)]
pub struct F1Calculator {
    k: u8,
    hasher: blake3::Hasher,
}

impl F1Calculator {
    pub fn new(k: u8, plot_id: &[u8; 32]) -> Self {
        Self {
            k,
            hasher: blake3::Hasher::new_keyed(plot_id),
        }
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    /// `f1` for every `x` in `start..start + count`, in order.
    pub fn evaluate_range(&self, start: u64, count: u64) -> Result<Vec<u64>> {
        let k = self.k as u64;
        let first_bit = start * k;
        let skip = (first_bit % 8) as usize;
        let len = (skip as u64 + count * k).div_ceil(8) as usize;

        let mut stream = self.hasher.finalize_xof();
        stream.set_position(first_bit / 8);
        let mut buf = vec![0u8; len];
        stream.fill(&mut buf);

        let mut reader = BitReader::new(&buf);
        reader.skip(skip)?;
        let ext_shift = self.k - PARAM_EXT;
        let mut out = Vec::with_capacity(count as usize);
        for x in start..start + count {
            let bits = reader.read(self.k as usize)?;
            out.push((bits << PARAM_EXT) | (x >> ext_shift));
        }
        Ok(out)
    }

    pub fn evaluate(&self, x: u64) -> Result<u64> {
        let y = self.evaluate_range(x, 1)?;
        Ok(y[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_agree_with_single_values() -> anyhow::Result<()> {
        let f1 = F1Calculator::new(13, &[5u8; 32]);
        let range = f1.evaluate_range(1_000, 300)?;
        for (i, &y) in range.iter().enumerate() {
            assert_eq!(y, f1.evaluate(1_000 + i as u64)?);
        }
        // Unaligned starts see the same stream.
        assert_eq!(&f1.evaluate_range(1_003, 10)?[..], &range[3..13]);
        Ok(())
    }

    #[test]
    fn output_width_and_extension() -> anyhow::Result<()> {
        let k = 12u8;
        let f1 = F1Calculator::new(k, &[9u8; 32]);
        let all = f1.evaluate_range(0, 1 << k)?;
        for (x, &y) in all.iter().enumerate() {
            assert!(y < 1 << (k + PARAM_EXT));
            assert_eq!(y & 0x3F, x as u64 >> (k - PARAM_EXT));
        }
        Ok(())
    }

    #[test]
    fn keyed_by_plot_id() -> anyhow::Result<()> {
        let a = F1Calculator::new(16, &[1u8; 32]).evaluate_range(0, 64)?;
        let b = F1Calculator::new(16, &[2u8; 32]).evaluate_range(0, 64)?;
        assert_ne!(a, b);
        Ok(())
    }
}
