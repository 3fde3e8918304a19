use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::{decode_records, with_retries, Record, SortError};

/// Streams fixed-width records into a table file.
///
/// The table is only usable once [`finish`](TableWriter::finish) has flushed
/// and fsynced it; that call is the durability point a phase waits on before
/// the next table is derived from this one.
pub struct TableWriter<R: Record> {
    file: BufWriter<File>,
    path: PathBuf,
    len: u64,
    io_retries: u32,
    scratch: Vec<u8>,
    _marker: PhantomData<R>,
}

impl<R: Record> TableWriter<R> {
    pub fn create<P: AsRef<Path>>(path: P, io_retries: u32) -> Result<Self, SortError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file: BufWriter::with_capacity(1 << 20, file),
            path,
            len: 0,
            io_retries,
            scratch: vec![0u8; R::WIDTH],
            _marker: PhantomData,
        })
    }

    pub fn push(&mut self, record: &R) -> Result<(), SortError> {
        record.write_to(&mut self.scratch);
        self.file.write_all(&self.scratch)?;
        self.len += 1;
        Ok(())
    }

    pub fn extend(&mut self, records: &[R]) -> Result<(), SortError> {
        for record in records {
            self.push(record)?;
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flushes, fsyncs and hands back a readable [`TableFile`].
    pub fn finish(self) -> Result<TableFile<R>, SortError> {
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(TableFile {
            path: self.path,
            len: self.len,
            io_retries: self.io_retries,
            _marker: PhantomData,
        })
    }
}

/// A finished, immutable table of fixed-width records addressed by dense
/// position.
///
/// Every read opens its own handle, so a `TableFile` can be shared by
/// parallel workers without any locking.
#[derive(Debug)]
pub struct TableFile<R> {
    path: PathBuf,
    len: u64,
    io_retries: u32,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> TableFile<R> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads `count` records starting at `start`.
    pub fn read_range(&self, start: u64, count: u64) -> Result<Vec<R>, SortError> {
        let end = start.saturating_add(count);
        if end > self.len {
            return Err(SortError::OutOfRange {
                position: end.saturating_sub(1),
                len: self.len,
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut file = File::open(&self.path)?;
        read_at::<R>(&mut file, start, count, self.io_retries, &self.path)
    }

    /// Reads a single record.
    pub fn get(&self, position: u64) -> Result<R, SortError> {
        let mut records = self.read_range(position, 1)?;
        records.pop().ok_or(SortError::OutOfRange {
            position,
            len: self.len,
        })
    }

    /// Reads the whole table into memory.
    pub fn read_all(&self) -> Result<Vec<R>, SortError> {
        self.read_range(0, self.len)
    }

    /// Sequential scan in chunks of at most `chunk_records` records.
    pub fn chunks(&self, chunk_records: usize) -> Result<TableChunks<R>, SortError> {
        Ok(TableChunks {
            file: File::open(&self.path)?,
            path: self.path.clone(),
            next: 0,
            len: self.len,
            chunk: chunk_records.max(1) as u64,
            io_retries: self.io_retries,
            failed: false,
            _marker: PhantomData,
        })
    }

    /// Forward-biased point lookups backed by a read-ahead window.
    pub fn lookup(&self, window_records: usize) -> SequentialLookup<'_, R> {
        SequentialLookup {
            table: self,
            window: Vec::new(),
            window_start: 0,
            window_records: window_records.max(1) as u64,
        }
    }

    /// Deletes the backing file.
    pub fn remove(self) -> Result<(), SortError> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn read_at<R: Record>(
    file: &mut File,
    start: u64,
    count: u64,
    io_retries: u32,
    path: &Path,
) -> Result<Vec<R>, SortError> {
    let what = path.display().to_string();
    let mut buf = vec![0u8; count as usize * R::WIDTH];
    with_retries(io_retries, &what, || {
        file.seek(SeekFrom::Start(start * R::WIDTH as u64))?;
        file.read_exact(&mut buf)?;
        Ok(())
    })?;
    Ok(decode_records(&buf))
}

/// Iterator returned by [`TableFile::chunks`].
pub struct TableChunks<R> {
    file: File,
    path: PathBuf,
    next: u64,
    len: u64,
    chunk: u64,
    io_retries: u32,
    failed: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> TableChunks<R> {
    /// Position of the first record of the next chunk.
    pub fn position(&self) -> u64 {
        self.next
    }
}

impl<R: Record> Iterator for TableChunks<R> {
    type Item = Result<Vec<R>, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.len {
            return None;
        }
        let count = self.chunk.min(self.len - self.next);
        let result = read_at::<R>(
            &mut self.file,
            self.next,
            count,
            self.io_retries,
            &self.path,
        );
        match result {
            Ok(records) => {
                self.next += count;
                Some(Ok(records))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Point lookups over a [`TableFile`] for callers whose positions mostly
/// ascend, as in a merge join against a sorted stream.
pub struct SequentialLookup<'a, R: Record> {
    table: &'a TableFile<R>,
    window: Vec<R>,
    window_start: u64,
    window_records: u64,
}

impl<R: Record> SequentialLookup<'_, R> {
    pub fn get(&mut self, position: u64) -> Result<R, SortError> {
        let in_window = position >= self.window_start
            && position < self.window_start + self.window.len() as u64;
        if !in_window {
            if position >= self.table.len() {
                return Err(SortError::OutOfRange {
                    position,
                    len: self.table.len(),
                });
            }
            let count = self.window_records.min(self.table.len() - position);
            self.window = self.table.read_range(position, count)?;
            self.window_start = position;
        }
        Ok(self.window[(position - self.window_start) as usize])
    }
}
