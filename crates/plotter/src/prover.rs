use std::path::Path;

use plotfile::{line_point_to_square, PlotReader};

use crate::error::Result;

/// Number of `x` values in a full proof.
pub const PROOF_LEN: usize = 64;

/// Answers challenges from a finished plot.
pub struct Prover {
    reader: PlotReader,
}

impl Prover {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            reader: PlotReader::open(path)?,
        })
    }

    pub fn reader(&self) -> &PlotReader {
        &self.reader
    }

    /// Every proof whose root value equals `challenge`, which is taken modulo
    /// `2^k`.
    ///
    /// Each proof lists its [`PROOF_LEN`] `x` values leaf by leaf; siblings are
    /// adjacent, and each half of the list is one subtree.
    pub fn find_proofs(&self, challenge: u64) -> Result<Vec<Vec<u64>>> {
        let k = self.reader.k();
        let target = challenge & ((1u64 << k) - 1);
        self.reader
            .lookup(7, target)?
            .into_iter()
            .map(|index| self.proof_at(index))
            .collect()
    }

    /// Walks from root entry `index` down to the table 1 `x` values.
    pub fn proof_at(&self, index: u64) -> Result<Vec<u64>> {
        let mut nodes = vec![self.reader.position_at(index)?];
        for table in (1..=6u8).rev() {
            let mut next = Vec::with_capacity(nodes.len() * 2);
            for &position in &nodes {
                let (a, b) = line_point_to_square(self.reader.value_at(table, position)?);
                next.push(a);
                next.push(b);
            }
            nodes = next;
        }
        Ok(nodes)
    }
}
