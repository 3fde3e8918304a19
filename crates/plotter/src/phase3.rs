//! Phase 3: compression.
//!
//! For each table `t` in 2..=7 the two back-references of every entry are
//! resolved against the previous table's position map (for table 2, the `x`
//! values) by two external sorts, by left then by right, each followed by a
//! forward merge join. The resolved pair becomes a line point. Line points
//! are sorted and streamed into the parks of plot table `t - 1`; an entry's
//! rank in that order is its new position, and a fourth sort turns the ranks
//! back into a position map for the next table.
//!
//! Table 7 ranks are sorted by root value instead, giving the root parks and
//! the packed positions into plot table 6.

use std::fs::File;
use std::io::BufWriter;

use bucketsort::{BucketSorter, SortedBuckets, TableFile, TableWriter};
use plotfile::{
    bits_for_count, square_to_line_point, stub_bits_for, PackedWriter, ParkSummary, ParkWriter,
    PositionsSource, TableSource,
};
use tracing::debug;

use crate::context::PlotContext;
use crate::entry::{key_bits_below, BackRef, JoinRecord};
use crate::error::{PlotError, Result};
use crate::phase2::Phase2Output;

/// Records per scan chunk.
const SCAN_CHUNK: usize = 1 << 16;

/// Read-ahead window of the merge-join lookups.
const LOOKUP_WINDOW: usize = 1 << 16;

pub struct Phase3Output {
    /// Parks of plot tables 1..=7.
    pub tables: Vec<TableSource>,
    pub positions: PositionsSource,
}

/// Exclusive upper bound of line points over values below `range`.
pub fn line_point_limit(range: u64) -> u128 {
    let range = range as u128;
    (range * range.saturating_sub(1) / 2).max(1)
}

pub fn run(ctx: &PlotContext, phase2: Phase2Output) -> Result<Phase3Output> {
    let k = ctx.k();
    let mut tables = Vec::with_capacity(7);
    let mut map = phase2.x_values;
    let mut range = 1u64 << k;

    for (i, refs) in phase2.tables.into_iter().enumerate() {
        let table = i as u8 + 2;
        let by_line_point = join_line_points(ctx, table, &refs, &map, range)?;
        let stub_bits = stub_bits_for(line_point_limit(range), refs.len());
        let (parks, ranks) = write_line_points(
            ctx,
            table,
            &by_line_point,
            stub_bits,
            key_bits_below(refs.len() as u128),
        )?;
        drop(by_line_point);

        let next = write_position_map(ctx, table, &ranks)?;
        tables.push(parks);
        std::mem::replace(&mut map, next).remove()?;
        range = refs.len();
        refs.remove()?;
    }

    let root = phase2.root;
    let by_line_point = join_line_points(ctx, 7, &root, &map, range)?;
    let stub_bits = stub_bits_for(line_point_limit(range), root.len());
    let (parks, by_root) = write_line_points(ctx, 7, &by_line_point, stub_bits, k as u32)?;
    drop(by_line_point);
    tables.push(parks);

    let root_stub_bits = stub_bits_for(1u128 << k, root.len());
    let (root_parks, positions) = write_root(ctx, &by_root, root_stub_bits, bits_for_count(root.len()))?;
    tables.push(root_parks);
    map.remove()?;
    root.remove()?;

    Ok(Phase3Output { tables, positions })
}

/// Resolves both back-references of `refs` through `map` and returns the
/// entries sorted by line point.
pub(crate) fn join_line_points(
    ctx: &PlotContext,
    table: u8,
    refs: &TableFile<BackRef>,
    map: &TableFile<u64>,
    range: u64,
) -> Result<SortedBuckets<JoinRecord>> {
    let ref_bits = key_bits_below(map.len() as u128);

    let mut by_left = BucketSorter::new(
        ctx.scratch_dir(),
        &format!("table{table}-by-left"),
        ctx.sort_config(ref_bits),
    )?;
    let mut origin = 0u64;
    for chunk in refs.chunks(SCAN_CHUNK)? {
        for r in chunk? {
            by_left.push(JoinRecord {
                key: r.left,
                other: r.right,
                origin,
                tag: if table == 7 { r.y } else { 0 },
            })?;
            origin += 1;
        }
    }
    let by_left = by_left.finish()?;

    let mut by_right = BucketSorter::new(
        ctx.scratch_dir(),
        &format!("table{table}-by-right"),
        ctx.sort_config(ref_bits),
    )?;
    let mut lookup = map.lookup(LOOKUP_WINDOW);
    by_left.drain::<PlotError, _>(|_, records| {
        for r in records {
            by_right.push(JoinRecord {
                key: r.other,
                other: lookup.get(r.key)?,
                origin: r.origin,
                tag: r.tag,
            })?;
        }
        Ok(())
    })?;
    drop(by_left);
    let by_right = by_right.finish()?;

    let mut by_line_point = BucketSorter::new(
        ctx.scratch_dir(),
        &format!("table{table}-by-lp"),
        ctx.sort_config(key_bits_below(line_point_limit(range))),
    )?;
    let mut lookup = map.lookup(LOOKUP_WINDOW);
    by_right.drain::<PlotError, _>(|_, records| {
        for r in records {
            let right = lookup.get(r.key)?;
            by_line_point.push(JoinRecord {
                key: square_to_line_point(r.other, right),
                other: 0,
                origin: r.origin,
                tag: r.tag,
            })?;
        }
        Ok(())
    })?;
    Ok(by_line_point.finish()?)
}

/// Streams sorted line points into the parks of plot table `table - 1` and
/// sorts each entry's rank by origin (or, for table 7, by root value).
fn write_line_points(
    ctx: &PlotContext,
    table: u8,
    by_line_point: &SortedBuckets<JoinRecord>,
    stub_bits: u8,
    rank_key_bits: u32,
) -> Result<(TableSource, SortedBuckets<JoinRecord>)> {
    let plot_table = table - 1;
    let parks_path = ctx.scratch_path(&format!("plot-table{plot_table}.parks"));
    let mut parks = ParkWriter::new(BufWriter::new(File::create(&parks_path)?), stub_bits);
    let mut ranks = BucketSorter::new(
        ctx.scratch_dir(),
        &format!("table{table}-ranks"),
        ctx.sort_config(rank_key_bits),
    )?;

    let mut rank = 0u64;
    by_line_point.drain::<PlotError, _>(|_, records| {
        for r in records {
            parks.push(r.key)?;
            ranks.push(JoinRecord {
                key: if table == 7 { r.tag } else { r.origin },
                other: rank,
                origin: r.origin,
                tag: r.tag,
            })?;
            rank += 1;
        }
        Ok(())
    })?;

    let summary = finish_parks(parks)?;
    debug!(
        table = plot_table,
        entries = summary.entries,
        parks = summary.park_count(),
        stub_bits,
        "line points written"
    );
    Ok((TableSource { summary, parks_path }, ranks.finish()?))
}

/// Turns ranks sorted by origin into a dense position map.
fn write_position_map(
    ctx: &PlotContext,
    table: u8,
    ranks: &SortedBuckets<JoinRecord>,
) -> Result<TableFile<u64>> {
    let path = ctx.scratch_path(&format!("phase3-map{table}.tbl"));
    let mut writer = TableWriter::create(path, ctx.io_retries())?;
    ranks.drain::<PlotError, _>(|_, records| {
        for r in records {
            debug_assert_eq!(r.origin, writer.len());
            writer.push(&r.other)?;
        }
        Ok(())
    })?;
    Ok(writer.finish()?)
}

/// Writes root values in order together with their packed positions.
fn write_root(
    ctx: &PlotContext,
    by_root: &SortedBuckets<JoinRecord>,
    stub_bits: u8,
    position_bits: u8,
) -> Result<(TableSource, PositionsSource)> {
    let parks_path = ctx.scratch_path("plot-table7.parks");
    let positions_path = ctx.scratch_path("plot-positions.bin");
    let mut parks = ParkWriter::new(BufWriter::new(File::create(&parks_path)?), stub_bits);
    let mut positions = PackedWriter::new(BufWriter::new(File::create(&positions_path)?), position_bits);

    by_root.drain::<PlotError, _>(|_, records| {
        for r in records {
            parks.push(r.key)?;
            positions.push(r.other)?;
        }
        Ok(())
    })?;

    let summary = finish_parks(parks)?;
    let (out, entries) = positions.finish()?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    debug!(entries, parks = summary.park_count(), position_bits, "root table written");

    Ok((
        TableSource { summary, parks_path },
        PositionsSource {
            entries,
            bits: position_bits,
            path: positions_path,
        },
    ))
}

fn finish_parks(parks: ParkWriter<BufWriter<File>>) -> Result<ParkSummary> {
    let (out, summary) = parks.finish()?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::{phase1, phase2};
    use anyhow::Result;
    use plotfile::park::decode_park;
    use plotfile::{line_point_to_square, PARK_BYTES};
    use tempfile::tempdir;

    fn read_parks(source: &TableSource) -> Result<Vec<u64>> {
        let bytes = std::fs::read(&source.parks_path)?;
        let mut values = Vec::new();
        for park in bytes.chunks_exact(PARK_BYTES) {
            values.extend(decode_park(park, source.summary.stub_bits)?);
        }
        Ok(values)
    }

    #[test]
    fn line_point_limit_bounds_keys() {
        assert_eq!(line_point_limit(0), 1);
        assert_eq!(line_point_limit(2), 1);
        let range = 1u64 << 12;
        let max = square_to_line_point(range - 1, range - 2) as u128;
        assert!(max < line_point_limit(range));
    }

    #[test]
    fn collated_tables_are_consistent() -> Result<()> {
        let dir = tempdir()?;
        let ctx = test_context(dir.path(), 12, 4);
        let (compacted_lens, out) = ctx.install(|| -> crate::error::Result<_> {
            let forward = phase1::run(&ctx)?;
            let compacted = phase2::run(&ctx, forward)?;
            let mut lens = vec![compacted.x_values.len()];
            lens.extend(compacted.tables.iter().map(|t| t.len()));
            lens.push(compacted.root.len());
            Ok((lens, run(&ctx, compacted)?))
        })?;
        assert_eq!(out.tables.len(), 7);

        let mut plot_tables = Vec::new();
        for (i, source) in out.tables.iter().enumerate() {
            let values = read_parks(source)?;
            assert_eq!(values.len() as u64, source.summary.entries);
            assert!(values.windows(2).all(|w| w[0] <= w[1]), "plot table {}", i + 1);
            plot_tables.push(values);
        }

        // Plot table t holds one line point per entry of compacted table t + 1.
        for t in 0..6 {
            assert_eq!(plot_tables[t].len() as u64, compacted_lens[t + 1]);
            let below = if t == 0 { 1 << 12 } else { compacted_lens[t] };
            for &lp in &plot_tables[t] {
                let (x, y) = line_point_to_square(lp);
                assert!(y < x && x < below, "plot table {}", t + 1);
            }
        }
        // The root table holds one value per table 7 entry.
        assert_eq!(plot_tables[6].len() as u64, compacted_lens[6]);
        assert!(plot_tables[6].iter().all(|&f7| f7 < 1 << 12));
        assert_eq!(out.positions.entries, compacted_lens[6]);
        Ok(())
    }
}
