use rayon::prelude::*;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{with_retries, Record, RunReader, RunWriter, SortError, TableFile, TableWriter};

/// Key bits consumed by each level of sub-bucketing.
pub const SUB_BUCKET_BITS: u32 = 4;

/// Bucketing and memory parameters for one external sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortConfig {
    /// Number of significant bits in every record's sort key.
    pub key_bits: u32,
    /// The top `bucket_bits` of the key select the bucket.
    pub bucket_bits: u32,
    /// Largest bucket (in bytes) sorted in memory in one piece.
    pub memory_budget: usize,
    /// Per-bucket write buffer; a full buffer becomes one spill block.
    pub write_buffer_bytes: usize,
    /// Extra attempts for transient read failures.
    pub io_retries: u32,
}

impl SortConfig {
    pub fn new(key_bits: u32) -> Self {
        Self {
            key_bits,
            bucket_bits: 7,
            memory_budget: 256 << 20,
            write_buffer_bytes: 64 << 10,
            io_retries: 3,
        }
    }

    pub fn with_bucket_bits(mut self, bucket_bits: u32) -> Self {
        self.bucket_bits = bucket_bits;
        self
    }

    pub fn with_memory_budget(mut self, memory_budget: usize) -> Self {
        self.memory_budget = memory_budget;
        self
    }

    pub fn with_write_buffer_bytes(mut self, write_buffer_bytes: usize) -> Self {
        self.write_buffer_bytes = write_buffer_bytes;
        self
    }

    pub fn with_io_retries(mut self, io_retries: u32) -> Self {
        self.io_retries = io_retries;
        self
    }

    /// Bucket bits actually used; never more than the key has.
    pub fn effective_bucket_bits(&self) -> u32 {
        self.bucket_bits.min(self.key_bits)
    }

    pub fn num_buckets(&self) -> usize {
        1usize << self.effective_bucket_bits()
    }

    pub fn validate(&self) -> Result<(), SortError> {
        if self.key_bits == 0 || self.key_bits > 64 {
            return Err(SortError::InvalidConfig(format!(
                "key_bits must be in 1..=64, got {}",
                self.key_bits
            )));
        }
        if self.bucket_bits > 16 {
            return Err(SortError::InvalidConfig(format!(
                "bucket_bits must be at most 16, got {}",
                self.bucket_bits
            )));
        }
        if self.memory_budget == 0 || self.write_buffer_bytes == 0 {
            return Err(SortError::InvalidConfig(
                "memory budget and write buffer must be non-zero".into(),
            ));
        }
        let buffers = self.num_buckets().saturating_mul(self.write_buffer_bytes);
        if buffers > self.memory_budget {
            return Err(SortError::InvalidConfig(format!(
                "{} buckets x {} byte buffers exceed the {} byte memory budget",
                self.num_buckets(),
                self.write_buffer_bytes,
                self.memory_budget
            )));
        }
        Ok(())
    }

    fn shift(&self) -> u32 {
        self.key_bits - self.effective_bucket_bits()
    }
}

/// Write side of an external sort.
///
/// Records are pushed in any order. Resident memory is bounded by
/// `num_buckets * write_buffer_bytes`; everything else lives in per-bucket
/// spill runs under `dir`.
pub struct BucketSorter<R: Record> {
    dir: PathBuf,
    name: String,
    config: SortConfig,
    buffers: Vec<Vec<R>>,
    runs: Vec<Option<RunWriter>>,
    buffer_records: usize,
    len: u64,
}

impl<R: Record> BucketSorter<R> {
    /// Creates a sorter whose spill runs are named `{name}-bucket-{i}.run`
    /// inside `dir`. The directory must exist.
    pub fn new<P: AsRef<Path>>(dir: P, name: &str, config: SortConfig) -> Result<Self, SortError> {
        config.validate()?;
        let buckets = config.num_buckets();
        let buffer_records = (config.write_buffer_bytes / R::WIDTH).max(1);
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
            buffers: (0..buckets).map(|_| Vec::new()).collect(),
            runs: (0..buckets).map(|_| None).collect(),
            buffer_records,
            config,
            len: 0,
        })
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Records pushed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, record: R) -> Result<(), SortError> {
        let key = record.sort_key();
        if self.config.key_bits < 64 && key >> self.config.key_bits != 0 {
            return Err(SortError::KeyOutOfRange {
                key,
                key_bits: self.config.key_bits,
            });
        }
        let bucket = bucket_of(key, self.config.shift());
        self.buffers[bucket].push(record);
        self.len += 1;
        if self.buffers[bucket].len() >= self.buffer_records {
            self.spill(bucket)?;
        }
        Ok(())
    }

    pub fn extend(&mut self, records: &[R]) -> Result<(), SortError> {
        for record in records {
            self.push(*record)?;
        }
        Ok(())
    }

    fn spill(&mut self, bucket: usize) -> Result<(), SortError> {
        if self.buffers[bucket].is_empty() {
            return Ok(());
        }
        if self.runs[bucket].is_none() {
            let path = self.dir.join(format!("{}-bucket-{}.run", self.name, bucket));
            self.runs[bucket] = Some(RunWriter::create(path)?);
        }
        if let Some(run) = self.runs[bucket].as_mut() {
            run.append(&self.buffers[bucket])?;
        }
        self.buffers[bucket].clear();
        Ok(())
    }

    /// Flushes every buffer and switches to the read-back phase.
    pub fn finish(mut self) -> Result<SortedBuckets<R>, SortError> {
        for bucket in 0..self.buffers.len() {
            self.spill(bucket)?;
        }
        let mut runs = Vec::with_capacity(self.runs.len());
        for run in std::mem::take(&mut self.runs) {
            match run {
                Some(writer) => {
                    let path = writer.path().to_path_buf();
                    let records = writer.finish()?;
                    runs.push(BucketRun {
                        path: Some(path),
                        records,
                    });
                }
                None => runs.push(BucketRun {
                    path: None,
                    records: 0,
                }),
            }
        }
        debug!(name = %self.name, records = self.len, buckets = runs.len(), "bucket sort write phase done");
        Ok(SortedBuckets {
            dir: self.dir.clone(),
            name: self.name.clone(),
            config: self.config.clone(),
            runs,
            len: self.len,
            _marker: PhantomData,
        })
    }
}

impl<R: Record> Drop for BucketSorter<R> {
    fn drop(&mut self) {
        for run in self.runs.iter().flatten() {
            let _ = fs::remove_file(run.path());
        }
    }
}

fn bucket_of(key: u64, shift: u32) -> usize {
    if shift >= 64 {
        0
    } else {
        (key >> shift) as usize
    }
}

#[derive(Debug)]
struct BucketRun {
    path: Option<PathBuf>,
    records: u64,
}

/// Read side of an external sort. Spill runs are deleted on drop.
pub struct SortedBuckets<R: Record> {
    dir: PathBuf,
    name: String,
    config: SortConfig,
    runs: Vec<BucketRun>,
    len: u64,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> SortedBuckets<R> {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_buckets(&self) -> usize {
        self.runs.len()
    }

    pub fn bucket_len(&self, bucket: usize) -> u64 {
        self.runs.get(bucket).map(|r| r.records).unwrap_or(0)
    }

    /// Hands every record to `sink` in ascending key order, equal keys in
    /// push order.
    ///
    /// `sink` receives `(bucket, sorted_records)`. A bucket that had to be
    /// sub-bucketed arrives in several consecutive calls with the same bucket
    /// index.
    pub fn drain<E, F>(&self, mut sink: F) -> Result<(), E>
    where
        E: From<SortError>,
        F: FnMut(usize, Vec<R>) -> Result<(), E>,
    {
        for (bucket, run) in self.runs.iter().enumerate() {
            let Some(path) = run.path.as_ref() else {
                continue;
            };
            let bytes = run.records * R::WIDTH as u64;
            if bytes <= self.config.memory_budget as u64 {
                let records = self.load_sorted(path)?;
                sink(bucket, records)?;
            } else {
                let consumed = self.config.effective_bucket_bits();
                self.split_and_sort(bucket, path, bytes, consumed, 0, &mut sink)?;
            }
        }
        Ok(())
    }

    /// Drains into a durable table file and returns it together with the
    /// record count of every bucket.
    pub fn write_table<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(TableFile<R>, Vec<u64>), SortError> {
        let mut writer = TableWriter::create(path, self.config.io_retries)?;
        let mut counts = vec![0u64; self.num_buckets()];
        self.drain::<SortError, _>(|bucket, records| {
            counts[bucket] += records.len() as u64;
            writer.extend(&records)
        })?;
        Ok((writer.finish()?, counts))
    }

    fn load_sorted(&self, path: &Path) -> Result<Vec<R>, SortError> {
        let what = path.display().to_string();
        let mut records = with_retries(self.config.io_retries, &what, || {
            RunReader::open(path)?.read_all::<R>()
        })?;
        records.par_sort_by_key(|r| r.sort_key());
        Ok(records)
    }

    fn split_and_sort<E, F>(
        &self,
        bucket: usize,
        path: &Path,
        bytes: u64,
        consumed_bits: u32,
        depth: u32,
        sink: &mut F,
    ) -> Result<(), E>
    where
        E: From<SortError>,
        F: FnMut(usize, Vec<R>) -> Result<(), E>,
    {
        let remaining = self.config.key_bits - consumed_bits;
        if remaining == 0 {
            return Err(SortError::BucketTooLarge {
                bucket,
                bytes,
                budget: self.config.memory_budget,
            }
            .into());
        }
        let sub_bits = SUB_BUCKET_BITS.min(remaining);
        let shift = remaining - sub_bits;
        debug!(
            name = %self.name,
            bucket,
            depth,
            bytes,
            budget = self.config.memory_budget,
            "bucket exceeds memory budget, sub-bucketing"
        );

        let what = path.display().to_string();
        let subs = with_retries(self.config.io_retries, &what, || {
            self.partition(bucket, path, depth, sub_bits, shift)
        })?;

        for (sub_path, records) in subs {
            let sub_bytes = records * R::WIDTH as u64;
            let result = if records == 0 {
                Ok(())
            } else if sub_bytes <= self.config.memory_budget as u64 {
                match self.load_sorted(&sub_path) {
                    Ok(sorted) => sink(bucket, sorted),
                    Err(e) => Err(e.into()),
                }
            } else {
                self.split_and_sort(
                    bucket,
                    &sub_path,
                    sub_bytes,
                    consumed_bits + sub_bits,
                    depth + 1,
                    sink,
                )
            };
            let _ = fs::remove_file(&sub_path);
            result?;
        }
        Ok(())
    }

    /// Splits one run into `2^sub_bits` runs on the key bits just below the
    /// ones already consumed. Order inside each sub-run is preserved.
    fn partition(
        &self,
        bucket: usize,
        path: &Path,
        depth: u32,
        sub_bits: u32,
        shift: u32,
    ) -> Result<Vec<(PathBuf, u64)>, SortError> {
        let fanout = 1usize << sub_bits;
        let mask = (fanout - 1) as u64;
        let buffer_records = (self.config.write_buffer_bytes / R::WIDTH).max(1);

        let mut writers = Vec::with_capacity(fanout);
        for sub in 0..fanout {
            let sub_path = self.dir.join(format!(
                "{}-bucket-{}-d{}-s{}.run",
                self.name, bucket, depth, sub
            ));
            writers.push(RunWriter::create(sub_path)?);
        }
        let mut buffers: Vec<Vec<R>> = (0..fanout).map(|_| Vec::new()).collect();

        let mut reader = RunReader::open(path)?;
        reader.for_each_block::<R, _>(|block| {
            for record in block {
                let sub = ((record.sort_key() >> shift) & mask) as usize;
                buffers[sub].push(record);
                if buffers[sub].len() >= buffer_records {
                    writers[sub].append(&buffers[sub])?;
                    buffers[sub].clear();
                }
            }
            Ok(())
        })?;

        let mut out = Vec::with_capacity(fanout);
        for (writer, buffer) in writers.into_iter().zip(buffers) {
            let mut writer = writer;
            writer.append(&buffer)?;
            let sub_path = writer.path().to_path_buf();
            let records = writer.finish()?;
            out.push((sub_path, records));
        }
        Ok(out)
    }
}

impl<R: Record> Drop for SortedBuckets<R> {
    fn drop(&mut self) {
        for run in &self.runs {
            if let Some(path) = &run.path {
                let _ = fs::remove_file(path);
            }
        }
        debug!(name = %self.name, dir = %self.dir.display(), "bucket sort runs released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use byteorder::{ByteOrder, LittleEndian};
    use tempfile::tempdir;

    /// Key plus the order it was pushed in, to check stability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Tagged {
        key: u64,
        seq: u64,
    }

    impl Record for Tagged {
        const WIDTH: usize = 16;

        fn sort_key(&self) -> u64 {
            self.key
        }

        fn write_to(&self, out: &mut [u8]) {
            LittleEndian::write_u64(&mut out[0..8], self.key);
            LittleEndian::write_u64(&mut out[8..16], self.seq);
        }

        fn read_from(bytes: &[u8]) -> Self {
            Self {
                key: LittleEndian::read_u64(&bytes[0..8]),
                seq: LittleEndian::read_u64(&bytes[8..16]),
            }
        }
    }

    /// Deterministic pseudo-random keys (xorshift).
    fn keys(n: usize, key_bits: u32, seed: u64) -> Vec<u64> {
        let mut s = seed | 1;
        (0..n)
            .map(|_| {
                s ^= s << 13;
                s ^= s >> 7;
                s ^= s << 17;
                s >> (64 - key_bits)
            })
            .collect()
    }

    fn small_config(key_bits: u32) -> SortConfig {
        SortConfig::new(key_bits)
            .with_bucket_bits(4)
            .with_write_buffer_bytes(256)
            .with_memory_budget(1 << 20)
    }

    fn drain_all<R: Record>(sorted: &SortedBuckets<R>) -> Result<Vec<R>> {
        let mut out = Vec::new();
        sorted.drain::<SortError, _>(|_, records| {
            out.extend(records);
            Ok(())
        })?;
        Ok(out)
    }

    // -------------------- Basic sorting --------------------

    #[test]
    fn sorts_across_buckets() -> Result<()> {
        let dir = tempdir()?;
        let input = keys(10_000, 20, 7);

        let mut sorter = BucketSorter::<u64>::new(dir.path(), "basic", small_config(20))?;
        sorter.extend(&input)?;
        assert_eq!(sorter.len(), 10_000);
        let sorted = sorter.finish()?;
        assert_eq!(sorted.num_buckets(), 16);

        let out = drain_all(&sorted)?;
        let mut expected = input.clone();
        expected.sort();
        assert_eq!(out, expected);
        Ok(())
    }

    #[test]
    fn equal_keys_keep_push_order() -> Result<()> {
        let dir = tempdir()?;
        let mut sorter = BucketSorter::<Tagged>::new(dir.path(), "stable", small_config(8))?;
        for seq in 0..2_000u64 {
            sorter.push(Tagged {
                key: (seq * 7) % 5,
                seq,
            })?;
        }
        let out = drain_all(&sorter.finish()?)?;
        for pair in out.windows(2) {
            assert!(pair[0].key <= pair[1].key);
            if pair[0].key == pair[1].key {
                assert!(pair[0].seq < pair[1].seq, "stability violated");
            }
        }
        Ok(())
    }

    #[test]
    fn bucket_counts_add_up() -> Result<()> {
        let dir = tempdir()?;
        let input = keys(5_000, 16, 3);
        let mut sorter = BucketSorter::<u64>::new(dir.path(), "counts", small_config(16))?;
        sorter.extend(&input)?;
        let sorted = sorter.finish()?;

        let total: u64 = (0..sorted.num_buckets()).map(|b| sorted.bucket_len(b)).sum();
        assert_eq!(total, 5_000);

        let (table, counts) = sorted.write_table(dir.path().join("counts.tbl"))?;
        assert_eq!(table.len(), 5_000);
        assert_eq!(counts.iter().sum::<u64>(), 5_000);
        let all = table.read_all()?;
        assert!(all.windows(2).all(|w| w[0] <= w[1]));
        Ok(())
    }

    #[test]
    fn empty_sort_drains_nothing() -> Result<()> {
        let dir = tempdir()?;
        let sorter = BucketSorter::<u64>::new(dir.path(), "empty", small_config(12))?;
        let sorted = sorter.finish()?;
        assert!(sorted.is_empty());
        assert!(drain_all(&sorted)?.is_empty());
        Ok(())
    }

    // -------------------- Sub-bucketing --------------------

    #[test]
    fn oversized_bucket_is_sub_bucketed() -> Result<()> {
        let dir = tempdir()?;
        // 4 buckets over 24-bit keys, 4 KiB budget: every bucket needs splitting.
        let config = SortConfig::new(24)
            .with_bucket_bits(2)
            .with_write_buffer_bytes(512)
            .with_memory_budget(4096);
        let input = keys(20_000, 24, 11);

        let mut sorter = BucketSorter::<u64>::new(dir.path(), "split", config)?;
        sorter.extend(&input)?;
        let out = drain_all(&sorter.finish()?)?;

        let mut expected = input;
        expected.sort();
        assert_eq!(out, expected);
        Ok(())
    }

    #[test]
    fn unsplittable_bucket_is_fatal() -> Result<()> {
        let dir = tempdir()?;
        let config = SortConfig::new(8)
            .with_bucket_bits(2)
            .with_write_buffer_bytes(64)
            .with_memory_budget(1024);

        let mut sorter = BucketSorter::<u64>::new(dir.path(), "dup", config)?;
        for _ in 0..1_000 {
            sorter.push(0x42)?;
        }
        let sorted = sorter.finish()?;
        let err = drain_all(&sorted).unwrap_err();
        let err = err.downcast::<SortError>()?;
        assert!(matches!(err, SortError::BucketTooLarge { bucket: 1, .. }));
        Ok(())
    }

    // -------------------- Validation --------------------

    #[test]
    fn key_out_of_range_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let mut sorter = BucketSorter::<u64>::new(dir.path(), "range", small_config(10))?;
        assert!(sorter.push(1023).is_ok());
        assert!(matches!(
            sorter.push(1024),
            Err(SortError::KeyOutOfRange { key: 1024, key_bits: 10 })
        ));
        Ok(())
    }

    #[test]
    fn buffers_must_fit_budget() {
        let config = SortConfig::new(32)
            .with_bucket_bits(10)
            .with_write_buffer_bytes(1 << 20)
            .with_memory_budget(1 << 20);
        assert!(config.validate().is_err());
        assert!(SortConfig::new(0).validate().is_err());
        assert!(SortConfig::new(32).validate().is_ok());
    }

    #[test]
    fn full_width_keys() -> Result<()> {
        let dir = tempdir()?;
        let input = vec![u64::MAX, 0, 1 << 63, 12345, u64::MAX - 1];
        let mut sorter = BucketSorter::<u64>::new(dir.path(), "wide", small_config(64))?;
        sorter.extend(&input)?;
        let out = drain_all(&sorter.finish()?)?;
        assert_eq!(out, vec![0, 12345, 1 << 63, u64::MAX - 1, u64::MAX]);
        Ok(())
    }

    #[test]
    fn runs_are_removed_on_drop() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut sorter = BucketSorter::<u64>::new(dir.path(), "gc", small_config(16))?;
            sorter.extend(&keys(1_000, 16, 5))?;
            let sorted = sorter.finish()?;
            assert!(std::fs::read_dir(dir.path())?.count() > 0);
            drop(sorted);
        }
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
