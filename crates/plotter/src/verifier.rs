//! Stateless proof verification.

use crate::error::Result;
use crate::f1::F1Calculator;
use crate::fx::FxCalculator;
use crate::matcher::is_match;
use crate::params::validate_k;
use crate::prover::PROOF_LEN;

/// Checks that `xs` is a proof for `challenge` in any plot with this id and
/// `k`.
///
/// The proof is rebuilt bottom-up: `f1` for every leaf, then for each sibling
/// pair the lower `y` is taken as the left side, the pair must satisfy the
/// matching rule, and `fx` gives the parent. The final root value must equal
/// the challenge modulo `2^k`.
///
/// Returns `Ok(false)` for a malformed or wrong proof; errors only on an
/// unsupported `k`.
pub fn verify_proof(plot_id: &[u8; 32], k: u8, challenge: u64, xs: &[u64]) -> Result<bool> {
    validate_k(k)?;
    if xs.len() != PROOF_LEN || xs.iter().any(|&x| x >> k != 0) {
        return Ok(false);
    }

    let f1 = F1Calculator::new(k, plot_id);
    let mut nodes = xs
        .iter()
        .map(|&x| Ok((f1.evaluate(x)?, x as u128)))
        .collect::<Result<Vec<(u64, u128)>>>()?;

    for table in 2..=7u8 {
        let fx = FxCalculator::new(k, table);
        let mut parents = Vec::with_capacity(nodes.len() / 2);
        for pair in nodes.chunks_exact(2) {
            let (left, right) = if pair[0].0 <= pair[1].0 {
                (pair[0], pair[1])
            } else {
                (pair[1], pair[0])
            };
            if !is_match(left.0, right.0) {
                return Ok(false);
            }
            parents.push(fx.evaluate(left.0, left.1, right.1)?);
        }
        nodes = parents;
    }

    Ok(nodes[0].0 == challenge & ((1u64 << k) - 1))
}
