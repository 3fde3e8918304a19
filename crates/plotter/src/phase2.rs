//! Phase 2: backward compaction.
//!
//! Walks from the root table down, marking which entries of each table are
//! referenced by a live entry of the table above. Table 7 is fully live.
//! Dead entries are dropped, survivors keep their order, and back-references
//! are rewritten to dense positions through a rank index over the liveness
//! bitmap. Only two bitmaps are alive at a time.

use bitvec::prelude::*;
use bucketsort::{SortError, TableFile, TableWriter};
use rayon::prelude::*;
use tracing::debug;

use crate::context::PlotContext;
use crate::entry::{BackRef, Entry};
use crate::error::{PlotError, Result};
use crate::phase1::Phase1Output;

/// Records per scan chunk.
const SCAN_CHUNK: usize = 1 << 16;

pub struct Phase2Output {
    /// `x` of every surviving table 1 entry, in table order.
    pub x_values: TableFile<u64>,
    /// Compacted tables 2..=6, `tables[0]` is table 2.
    pub tables: Vec<TableFile<BackRef>>,
    /// Compacted table 7.
    pub root: TableFile<BackRef>,
}

/// Liveness bitmap of one table plus a rank index over it.
pub struct Liveness {
    bits: BitVec<u64, Lsb0>,
    /// Live entries before each 64-bit word.
    rank: Vec<u64>,
    live: u64,
}

impl Liveness {
    pub fn all(len: u64) -> Self {
        Self::sealed(BitVec::repeat(true, len as usize))
    }

    pub fn none(len: u64) -> Self {
        Self::sealed(BitVec::repeat(false, len as usize))
    }

    fn sealed(bits: BitVec<u64, Lsb0>) -> Self {
        let mut rank = Vec::with_capacity(bits.as_raw_slice().len());
        let mut total = 0u64;
        for word in bits.as_raw_slice() {
            rank.push(total);
            total += word.count_ones() as u64;
        }
        let live = bits.count_ones() as u64;
        Self { bits, rank, live }
    }

    pub fn live_count(&self) -> u64 {
        self.live
    }

    pub fn is_live(&self, position: u64) -> bool {
        self.bits[position as usize]
    }

    /// Position of live entry `position` once dead entries are removed.
    pub fn new_position(&self, position: u64) -> u64 {
        debug_assert!(self.is_live(position));
        let word = (position / 64) as usize;
        let below = (1u64 << (position % 64)) - 1;
        self.rank[word] + (self.bits.as_raw_slice()[word] & below).count_ones() as u64
    }
}

pub fn run(ctx: &PlotContext, phase1: Phase1Output) -> Result<Phase2Output> {
    let mut tables = phase1.tables;
    if tables.len() != 7 {
        return Err(PlotError::InvalidConfig(format!(
            "expected 7 forward tables, got {}",
            tables.len()
        )));
    }
    let table1 = tables.remove(0);

    let mut live = Liveness::all(tables[5].len());
    ensure_live(7, &live)?;

    let mut compacted = Vec::with_capacity(6);
    while let Some(source) = tables.pop() {
        let table = tables.len() as u8 + 2;
        let parent_len = tables.last().map_or(table1.len(), |t| t.len());
        let parents = mark_parents(&source, &live, parent_len)?;
        ensure_live(table - 1, &parents)?;

        compacted.push(compact_table(ctx, table, &source, &live, &parents)?);
        source.remove()?;
        live = parents;
    }
    let x_values = compact_x_values(ctx, &table1, &live)?;
    table1.remove()?;

    compacted.reverse();
    let root = compacted.pop().ok_or_else(|| PlotError::EntropyExhausted { table: 7 })?;
    Ok(Phase2Output {
        x_values,
        tables: compacted,
        root,
    })
}

pub(crate) fn ensure_live(table: u8, live: &Liveness) -> Result<()> {
    if live.live_count() == 0 {
        return Err(PlotError::EntropyExhausted { table });
    }
    Ok(())
}

/// Marks both back-references of every live entry of `table`.
pub(crate) fn mark_parents(table: &TableFile<Entry>, live: &Liveness, parent_len: u64) -> Result<Liveness> {
    let mut bits = BitVec::<u64, Lsb0>::repeat(false, parent_len as usize);
    let mut position = 0u64;
    for chunk in table.chunks(SCAN_CHUNK)? {
        for entry in chunk? {
            if live.is_live(position) {
                for parent in [entry.left, entry.right] {
                    if parent >= parent_len {
                        return Err(SortError::OutOfRange {
                            position: parent,
                            len: parent_len,
                        }
                        .into());
                    }
                    bits.set(parent as usize, true);
                }
            }
            position += 1;
        }
    }
    Ok(Liveness::sealed(bits))
}

/// Rewrites the live entries of `source` with dense back-references.
pub(crate) fn compact_table(
    ctx: &PlotContext,
    table: u8,
    source: &TableFile<Entry>,
    live: &Liveness,
    parents: &Liveness,
) -> Result<TableFile<BackRef>> {
    ensure_live(table, live)?;
    let path = ctx.scratch_path(&format!("phase2-table{table}.tbl"));
    let mut writer = TableWriter::create(path, ctx.io_retries())?;

    rewrite_in_batches(ctx, source, live, &mut writer, |entry| BackRef {
        y: entry.y,
        left: parents.new_position(entry.left),
        right: parents.new_position(entry.right),
    })?;

    let file = writer.finish()?;
    debug!(table, before = source.len(), after = file.len(), "table compacted");
    Ok(file)
}

/// Keeps only the `x` of every live table 1 entry.
pub(crate) fn compact_x_values(
    ctx: &PlotContext,
    source: &TableFile<Entry>,
    live: &Liveness,
) -> Result<TableFile<u64>> {
    ensure_live(1, live)?;
    let path = ctx.scratch_path("phase2-table1.tbl");
    let mut writer = TableWriter::create(path, ctx.io_retries())?;
    rewrite_in_batches(ctx, source, live, &mut writer, |entry| entry.meta as u64)?;

    let file = writer.finish()?;
    debug!(table = 1, before = source.len(), after = file.len(), "table compacted");
    Ok(file)
}

/// Reads `threads` chunks at a time, filters and maps them in parallel, then
/// appends the results in order.
fn rewrite_in_batches<T, F>(
    ctx: &PlotContext,
    source: &TableFile<Entry>,
    live: &Liveness,
    writer: &mut TableWriter<T>,
    map: F,
) -> Result<()>
where
    T: bucketsort::Record,
    F: Fn(&Entry) -> T + Sync,
{
    let mut chunks = source.chunks(SCAN_CHUNK)?;
    loop {
        let base = chunks.position();
        let batch = chunks
            .by_ref()
            .take(ctx.threads())
            .collect::<std::result::Result<Vec<_>, SortError>>()?;
        if batch.is_empty() {
            return Ok(());
        }
        let rewritten: Vec<Vec<T>> = batch
            .par_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let first = base + (i * SCAN_CHUNK) as u64;
                chunk
                    .iter()
                    .zip(first..)
                    .filter(|(_, position)| live.is_live(*position))
                    .map(|(entry, _)| map(entry))
                    .collect()
            })
            .collect();
        for records in rewritten {
            writer.extend(&records)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::phase1;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn rank_index_counts_live_entries() {
        let mut bits = BitVec::<u64, Lsb0>::repeat(false, 200);
        for i in [0usize, 3, 63, 64, 130, 199] {
            bits.set(i, true);
        }
        let live = Liveness::sealed(bits);
        assert_eq!(live.live_count(), 6);
        let ranks: Vec<u64> = [0u64, 3, 63, 64, 130, 199]
            .iter()
            .map(|&p| live.new_position(p))
            .collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4, 5]);

        let all = Liveness::all(130);
        assert_eq!(all.live_count(), 130);
        assert_eq!(all.new_position(129), 129);
        assert_eq!(Liveness::none(10).live_count(), 0);
    }

    #[test]
    fn survivors_are_all_referenced() -> Result<()> {
        let dir = tempdir()?;
        let ctx = test_context(dir.path(), 12, 4);
        let out = ctx.install(|| -> crate::error::Result<_> {
            let tables = phase1::run(&ctx)?;
            run(&ctx, tables)
        })?;

        let mut lens = vec![out.x_values.len()];
        let mut all = Vec::new();
        for table in out.tables.iter().chain([&out.root]) {
            let entries = table.read_all()?;
            assert!(entries.windows(2).all(|w| w[0].y <= w[1].y));
            lens.push(entries.len() as u64);
            all.push(entries);
        }

        // Every entry of table i < 7 is referenced by table i + 1.
        for (i, entries) in all.iter().enumerate() {
            let mut referenced = vec![false; lens[i] as usize];
            for e in entries {
                referenced[e.left as usize] = true;
                referenced[e.right as usize] = true;
            }
            assert!(referenced.iter().all(|&r| r), "table {}", i + 1);
        }

        let xs = out.x_values.read_all()?;
        assert!(xs.iter().all(|&x| x < 1 << 12));
        assert!(lens[0] <= 1 << 12);
        Ok(())
    }

    #[test]
    fn table4_without_survivors_exhausts_entropy() -> Result<()> {
        let dir = tempdir()?;
        let ctx = test_context(dir.path(), 12, 4);
        let forward = ctx.install(|| phase1::run(&ctx))?;
        let (t3, t4) = (&forward.tables[2], &forward.tables[3]);

        let dead = Liveness::none(t4.len());
        let parents = mark_parents(t4, &dead, t3.len())?;
        assert_eq!(parents.live_count(), 0);
        assert!(matches!(
            ensure_live(3, &parents),
            Err(PlotError::EntropyExhausted { table: 3 })
        ));
        assert!(matches!(
            compact_table(&ctx, 4, t4, &dead, &parents),
            Err(PlotError::EntropyExhausted { table: 4 })
        ));
        Ok(())
    }
}
