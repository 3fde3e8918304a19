//! Phase 1: forward propagation.
//!
//! Table 1 is `f1` over every `x`. Each later table is built by sorting the
//! previous one by `y` and matching adjacent groups. Matching runs over
//! slices of the sorted table: a worker owns the left entries of its slice and
//! reads ahead until the group after its last group is complete, so matches
//! across slice boundaries are found exactly once. Slices never span sort
//! buckets and are small enough that a batch of `threads` of them fits the
//! matching budget.

use std::mem::size_of;

use bucketsort::{BucketSorter, TableFile};
use rayon::prelude::*;
use tracing::debug;

use crate::context::PlotContext;
use crate::entry::Entry;
use crate::error::{PlotError, Result};
use crate::f1::F1Calculator;
use crate::fx::{y_bits, FxCalculator};
use crate::matcher::{group, Matcher};

/// `x` values evaluated per parallel work unit.
const F1_CHUNK: u64 = 1 << 14;

/// Records fetched per read-ahead step past a slice's end.
const READ_AHEAD: u64 = 512;

/// Left entries reserved per worker for the read-ahead: one fetch step plus
/// the rest of the last group and the whole next group.
const READ_AHEAD_RESERVE: u64 = 2 * READ_AHEAD;

/// Smallest slice handed to a worker, whatever the budget.
const MIN_SLICE: u64 = 1_024;

/// Resident bytes per left entry while matching: the entry, its `y` and
/// about one output entry.
const MATCH_BYTES_PER_ENTRY: u64 = (2 * size_of::<Entry>() + size_of::<u64>()) as u64;

/// Sorted tables 1..=7, `tables[0]` is table 1.
pub struct Phase1Output {
    pub tables: Vec<TableFile<Entry>>,
}

/// A table sorted by `y`, with the position range of every sort bucket.
pub(crate) struct SortedTable {
    pub file: TableFile<Entry>,
    pub buckets: Vec<(u64, u64)>,
    /// Most bytes one matching batch held while this table was built.
    pub peak_match_bytes: u64,
}

pub fn run(ctx: &PlotContext) -> Result<Phase1Output> {
    let mut tables = Vec::with_capacity(7);
    let mut current = build_table1(ctx)?;
    for table in 2..=7u8 {
        let next = build_table(ctx, table, &current)?;
        tables.push(current.file);
        current = next;
    }
    tables.push(current.file);
    Ok(Phase1Output { tables })
}

/// Evaluates `f1` for all `2^k` inputs in parallel chunks.
pub(crate) fn build_table1(ctx: &PlotContext) -> Result<SortedTable> {
    let k = ctx.k();
    let f1 = F1Calculator::new(k, ctx.plot_id());
    let total = 1u64 << k;
    let chunks = total.div_ceil(F1_CHUNK);
    let batch = (ctx.threads() as u64 * 4).max(1);

    let mut sorter = BucketSorter::new(ctx.scratch_dir(), "table1", ctx.sort_config(y_bits(k, 1)))?;
    let mut next = 0;
    while next < chunks {
        let end = (next + batch).min(chunks);
        let outputs = (next..end)
            .into_par_iter()
            .map(|chunk| {
                let start = chunk * F1_CHUNK;
                f1.evaluate_range(start, F1_CHUNK.min(total - start))
            })
            .collect::<Result<Vec<_>>>()?;

        for (chunk, ys) in (next..end).zip(outputs) {
            let start = chunk * F1_CHUNK;
            for (x, y) in (start..).zip(ys) {
                sorter.push(Entry {
                    y,
                    meta: x as u128,
                    left: 0,
                    right: 0,
                })?;
            }
        }
        next = end;
    }
    finish_table(ctx, 1, sorter, 0)
}

/// Matches `prev` (table `table - 1`) into table `table`.
pub(crate) fn build_table(ctx: &PlotContext, table: u8, prev: &SortedTable) -> Result<SortedTable> {
    let k = ctx.k();
    let fx = FxCalculator::new(k, table);
    let mut sorter = BucketSorter::new(
        ctx.scratch_dir(),
        &format!("table{table}"),
        ctx.sort_config(y_bits(k, table)),
    )?;

    let slices = match_slices(&prev.buckets, slice_entries(ctx));
    let mut peak_match_bytes = 0;
    // At most `threads` slices resident at once; outputs join in slice order.
    for batch in slices.chunks(ctx.threads()) {
        let outputs = batch
            .par_iter()
            .map(|&slice| match_slice(&prev.file, slice, &fx))
            .collect::<Result<Vec<_>>>()?;
        let resident: u64 = outputs.iter().map(|(_, bytes)| bytes).sum();
        peak_match_bytes = peak_match_bytes.max(resident);
        for (entries, _) in outputs {
            sorter.extend(&entries)?;
        }
    }
    debug!(table, slices = slices.len(), peak_match_bytes, "table matched");

    let sorted = finish_table(ctx, table, sorter, peak_match_bytes)?;
    if sorted.file.is_empty() {
        return Err(PlotError::EntropyExhausted { table });
    }
    Ok(sorted)
}

fn finish_table(
    ctx: &PlotContext,
    table: u8,
    sorter: BucketSorter<Entry>,
    peak_match_bytes: u64,
) -> Result<SortedTable> {
    let sorted = sorter.finish()?;
    let path = ctx.scratch_path(&format!("phase1-table{table}.tbl"));
    let (file, counts) = sorted.write_table(path)?;

    let mut buckets = Vec::with_capacity(counts.len());
    let mut start = 0;
    for count in counts {
        buckets.push((start, count));
        start += count;
    }
    debug!(table, entries = file.len(), buckets = buckets.len(), "table sorted");
    Ok(SortedTable {
        file,
        buckets,
        peak_match_bytes,
    })
}

/// Left entries one worker may own so that `threads` workers together stay
/// inside the matching budget.
fn slice_entries(ctx: &PlotContext) -> u64 {
    let per_worker = ctx.config().match_budget() as u64 / ctx.threads().max(1) as u64;
    (per_worker / MATCH_BYTES_PER_ENTRY)
        .saturating_sub(READ_AHEAD_RESERVE)
        .max(MIN_SLICE)
}

/// Cuts every non-empty bucket into slices of at most `max_entries`.
fn match_slices(buckets: &[(u64, u64)], max_entries: u64) -> Vec<(u64, u64)> {
    let mut slices = Vec::new();
    for &(start, count) in buckets {
        let mut offset = 0;
        while offset < count {
            let n = max_entries.min(count - offset);
            slices.push((start + offset, n));
            offset += n;
        }
    }
    slices
}

/// Matches the left entries in `start..start + count` of `table`.
///
/// The range may begin or end inside a group: only owned entries act as the
/// left side, so cutting a group between two slices splits its pairs between
/// them in order. Returns the new entries and the bytes held while matching.
fn match_slice(
    table: &TableFile<Entry>,
    (start, count): (u64, u64),
    fx: &FxCalculator,
) -> Result<(Vec<Entry>, u64)> {
    let mut entries = table.read_range(start, count)?;
    let owned = entries.len();
    let Some(last) = entries.last() else {
        return Ok((Vec::new(), 0));
    };
    let stop_group = group(last.y) + 1;

    let mut position = start + count;
    'read_ahead: while position < table.len() {
        let n = READ_AHEAD.min(table.len() - position);
        for entry in table.read_range(position, n)? {
            if group(entry.y) > stop_group {
                break 'read_ahead;
            }
            entries.push(entry);
        }
        position += n;
    }

    let ys: Vec<u64> = entries.iter().map(|e| e.y).collect();
    let runs = group_runs(&ys);

    let mut matcher = Matcher::new();
    let mut pairs = Vec::new();
    let mut out = Vec::new();
    for window in runs.windows(2) {
        let (l_start, l_end) = window[0];
        let (r_start, r_end) = window[1];
        if l_start >= owned {
            break;
        }
        pairs.clear();
        matcher.find_matches(&ys[l_start..l_end.min(owned)], &ys[r_start..r_end], &mut pairs);
        for &(i, j) in &pairs {
            let l = l_start + i as usize;
            let r = r_start + j as usize;
            let (y, meta) = fx.evaluate(entries[l].y, entries[l].meta, entries[r].meta)?;
            out.push(Entry {
                y,
                meta,
                left: start + l as u64,
                right: start + r as u64,
            });
        }
    }
    let resident = ((entries.len() + out.len()) * size_of::<Entry>() + ys.len() * size_of::<u64>()) as u64;
    Ok((out, resident))
}

/// Index ranges of consecutive equal groups in sorted `ys`.
fn group_runs(ys: &[u64]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut begin = 0;
    for i in 1..=ys.len() {
        if i == ys.len() || group(ys[i]) != group(ys[begin]) {
            runs.push((begin, i));
            begin = i;
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlotConfig, MIN_MEMORY_BUDGET};
    use crate::context::tests::test_context;
    use crate::params::{PlotKeys, PlotParams};
    use crate::matcher::{is_match, PARAM_BC};
    use anyhow::Result;
    use tempfile::tempdir;

    // -------------------- Table 1 --------------------

    #[test]
    fn table1_holds_every_x_sorted() -> Result<()> {
        let dir = tempdir()?;
        let ctx = test_context(dir.path(), 12, 4);
        let t1 = ctx.install(|| build_table1(&ctx))?;

        let entries = t1.file.read_all()?;
        assert_eq!(entries.len(), 1 << 12);
        assert!(entries.windows(2).all(|w| w[0].y <= w[1].y));

        let mut xs: Vec<u64> = entries.iter().map(|e| e.meta as u64).collect();
        xs.sort_unstable();
        assert_eq!(xs, (0..1u64 << 12).collect::<Vec<_>>());

        let covered: u64 = t1.buckets.iter().map(|b| b.1).sum();
        assert_eq!(covered, 1 << 12);
        Ok(())
    }

    // -------------------- Matching --------------------

    #[test]
    fn every_entry_points_at_a_match() -> Result<()> {
        let dir = tempdir()?;
        let ctx = test_context(dir.path(), 12, 4);
        let out = ctx.install(|| run(&ctx))?;
        assert_eq!(out.tables.len(), 7);

        for table in 2..=7u8 {
            let prev = out.tables[table as usize - 2].read_all()?;
            let cur = out.tables[table as usize - 1].read_all()?;
            assert!(!cur.is_empty(), "table {table}");
            assert!(cur.windows(2).all(|w| w[0].y <= w[1].y));

            let fx = FxCalculator::new(12, table);
            for e in &cur {
                let l = prev[e.left as usize];
                let r = prev[e.right as usize];
                assert!(is_match(l.y, r.y), "table {table}");
                assert_eq!(fx.evaluate(l.y, l.meta, r.meta)?, (e.y, e.meta));
            }
        }
        Ok(())
    }

    #[test]
    fn bucket_boundaries_do_not_change_matches() -> Result<()> {
        let dir = tempdir()?;
        let coarse = test_context(dir.path(), 12, 1);
        let fine = test_context(dir.path(), 12, 8);

        let a = coarse.install(|| -> crate::error::Result<_> {
            let t1 = build_table1(&coarse)?;
            build_table(&coarse, 2, &t1)
        })?;
        let b = fine.install(|| -> crate::error::Result<_> {
            let t1 = build_table1(&fine)?;
            build_table(&fine, 2, &t1)
        })?;
        assert!(b.buckets.len() > a.buckets.len());
        assert_eq!(a.file.read_all()?, b.file.read_all()?);
        Ok(())
    }

    fn budget_context(dir: &std::path::Path, memory_budget: usize) -> PlotContext {
        let config = PlotConfig::new(dir, dir)
            .with_threads(4)
            .with_bucket_bits(1)
            .with_memory_budget(memory_budget);
        let params = PlotParams::new(18, PlotKeys::new([5u8; 32], [6u8; 32]), "budget");
        PlotContext::new(&config, &params).unwrap()
    }

    #[test]
    fn matching_batches_fit_the_budget() -> Result<()> {
        let dir = tempdir()?;
        let tight = budget_context(dir.path(), MIN_MEMORY_BUDGET);
        let roomy = budget_context(dir.path(), 1 << 30);

        let (t1, small) = tight.install(|| -> crate::error::Result<_> {
            let t1 = build_table1(&tight)?;
            let t2 = build_table(&tight, 2, &t1)?;
            Ok((t1, t2))
        })?;
        // Matching both whole buckets in one batch would not fit.
        let total: u64 = t1.buckets.iter().map(|b| b.1).sum();
        assert_eq!(t1.buckets.len(), 2);
        assert!(total * MATCH_BYTES_PER_ENTRY > MIN_MEMORY_BUDGET as u64);
        assert!(match_slices(&t1.buckets, slice_entries(&tight)).len() > t1.buckets.len());

        assert!(small.peak_match_bytes > 0);
        assert!(
            small.peak_match_bytes <= MIN_MEMORY_BUDGET as u64,
            "batch held {} bytes",
            small.peak_match_bytes
        );

        let whole = roomy.install(|| -> crate::error::Result<_> {
            let t1 = build_table1(&roomy)?;
            build_table(&roomy, 2, &t1)
        })?;
        assert_eq!(match_slices(&t1.buckets, slice_entries(&roomy)).len(), t1.buckets.len());
        assert_eq!(small.file.read_all()?, whole.file.read_all()?);
        Ok(())
    }

    #[test]
    fn slices_cover_buckets_in_order() {
        let buckets = [(0, 5), (5, 0), (5, 12)];
        assert_eq!(
            match_slices(&buckets, 4),
            vec![(0, 4), (4, 1), (5, 4), (9, 4), (13, 4)]
        );
        assert_eq!(match_slices(&buckets, 100), vec![(0, 5), (5, 12)]);
    }

    #[test]
    fn group_runs_split_on_group_change() {
        let bc = PARAM_BC;
        let ys = [1, 2, bc, bc + 5, 3 * bc];
        assert_eq!(group_runs(&ys), vec![(0, 2), (2, 4), (4, 5)]);
        assert!(group_runs(&[]).is_empty());
    }
}
