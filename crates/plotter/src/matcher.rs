//! Pairing rule between adjacent `y` groups.
//!
//! `y` values are split into groups of [`PARAM_BC`] consecutive values. A left
//! value in group `g` can only match right values in group `g + 1`, and only
//! the [`PARAM_M`] residues listed for its own residue and the parity of `g`.
//! The residue table is computed once per process.

use once_cell::sync::Lazy;

/// Extra bits appended to `f1` outputs.
pub const PARAM_EXT: u8 = 6;
/// Targets per left value.
pub const PARAM_M: usize = 64;
pub const PARAM_B: u64 = 119;
pub const PARAM_C: u64 = 127;
/// Group width, `B * C`.
pub const PARAM_BC: u64 = PARAM_B * PARAM_C;

type Targets = [u16; PARAM_M];

/// `L_TARGETS[parity][y_l % BC]` lists every right residue `y_l` matches.
static L_TARGETS: Lazy<[Vec<Targets>; 2]> = Lazy::new(|| [build_targets(0), build_targets(1)]);

fn build_targets(parity: u64) -> Vec<Targets> {
    (0..PARAM_BC)
        .map(|r| {
            let mut targets = [0u16; PARAM_M];
            for (m, slot) in targets.iter_mut().enumerate() {
                let m = m as u64;
                let column = ((r / PARAM_C + m) % PARAM_B) * PARAM_C;
                let row = ((2 * m + parity).pow(2) + r) % PARAM_C;
                *slot = (column + row) as u16;
            }
            targets
        })
        .collect()
}

pub fn group(y: u64) -> u64 {
    y / PARAM_BC
}

/// Right residues matched by `y_l`.
pub fn targets(y_l: u64) -> &'static Targets {
    let parity = (group(y_l) % 2) as usize;
    &L_TARGETS[parity][(y_l % PARAM_BC) as usize]
}

/// Whether `y_l` on the left pairs with `y_r` on the right.
pub fn is_match(y_l: u64, y_r: u64) -> bool {
    if group(y_r) != group(y_l) + 1 {
        return false;
    }
    let residue = (y_r % PARAM_BC) as u16;
    targets(y_l).contains(&residue)
}

/// Finds all matches between two adjacent groups.
///
/// Holds a residue map sized to one group that is reset after every call, so
/// one `Matcher` per worker avoids reallocating.
pub struct Matcher {
    /// `(first index, count)` of right entries per residue.
    rmap: Vec<(u32, u32)>,
    touched: Vec<usize>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            rmap: vec![(0, 0); PARAM_BC as usize],
            touched: Vec::new(),
        }
    }

    /// Appends `(left index, right index)` for every match to `out`.
    ///
    /// `left` must be one sorted group and `right` the sorted group after it.
    /// Pairs come out ordered by left index, then by target slot.
    pub fn find_matches(&mut self, left: &[u64], right: &[u64], out: &mut Vec<(u32, u32)>) {
        let (Some(&first_l), Some(&first_r)) = (left.first(), right.first()) else {
            return;
        };
        if group(first_r) != group(first_l) + 1 {
            return;
        }

        // Right is sorted, so equal residues are contiguous.
        for (j, &y) in right.iter().enumerate() {
            let r = (y % PARAM_BC) as usize;
            let slot = &mut self.rmap[r];
            if slot.1 == 0 {
                slot.0 = j as u32;
                self.touched.push(r);
            }
            slot.1 += 1;
        }

        for (i, &y) in left.iter().enumerate() {
            for &target in targets(y) {
                let (start, count) = self.rmap[target as usize];
                for j in start..start + count {
                    out.push((i as u32, j));
                }
            }
        }

        for r in self.touched.drain(..) {
            self.rmap[r] = (0, 0);
        }
    }
}
