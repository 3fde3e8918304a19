//! Line points: a bijection between unordered pairs `{x, y}` with `x != y`
//! and a single integer, `x·(x−1)/2 + y` for `x > y`.
//!
//! Sorting by line point sorts pairs by their larger element first, which
//! keeps consecutive line points close and their deltas small.

fn triangle(x: u64) -> u128 {
    let x = x as u128;
    x * x.saturating_sub(1) / 2
}

/// Encodes a pair of distinct values; argument order does not matter.
pub fn square_to_line_point(a: u64, b: u64) -> u64 {
    debug_assert_ne!(a, b, "line points encode distinct pairs");
    let (x, y) = if a > b { (a, b) } else { (b, a) };
    (triangle(x) + y as u128) as u64
}

/// Decodes a line point into `(x, y)` with `x > y`.
pub fn line_point_to_square(line_point: u64) -> (u64, u64) {
    let lp = line_point as u128;
    // Float estimate of x = (1 + sqrt(1 + 8·lp)) / 2, then exact correction.
    let estimate = ((8.0 * line_point as f64 + 1.0).sqrt() + 1.0) / 2.0;
    let mut x = estimate as u64;
    while x > 0 && triangle(x) > lp {
        x -= 1;
    }
    while triangle(x + 1) <= lp {
        x += 1;
    }
    (x, (lp - triangle(x)) as u64)
}
