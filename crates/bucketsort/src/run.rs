use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::{decode_records, encode_records, Record, SortError};

/// Size of the per-block header: payload_len (u32) + crc (u32).
const BLOCK_HEADER_BYTES: u64 = 4 + 4;

/// Append-only writer for one bucket's spill run.
pub struct RunWriter {
    file: BufWriter<File>,
    path: PathBuf,
    records: u64,
    bytes: u64,
}

impl RunWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SortError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
            records: 0,
            bytes: 0,
        })
    }

    /// Appends `records` as a single crc-framed block.
    pub fn append<R: Record>(&mut self, records: &[R]) -> Result<(), SortError> {
        if records.is_empty() {
            return Ok(());
        }
        let payload = encode_records(records);

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.write_all(&payload)?;

        self.records += records.len() as u64;
        self.bytes += payload.len() as u64;
        Ok(())
    }

    /// Number of records appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Payload bytes appended so far (block headers excluded).
    pub fn payload_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered blocks and returns the number of records written.
    pub fn finish(mut self) -> Result<u64, SortError> {
        self.file.flush()?;
        Ok(self.records)
    }
}

/// Reads back a spill run block by block, verifying every crc.
pub struct RunReader {
    rdr: BufReader<File>,
    path: PathBuf,
    offset: u64,
}

impl RunReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SortError> {
        let path = path.as_ref().to_path_buf();
        let f = File::open(&path)?;
        Ok(Self {
            rdr: BufReader::new(f),
            path,
            offset: 0,
        })
    }

    /// Reads the next block, or `None` at a clean end of file.
    pub fn next_block<R: Record>(&mut self) -> Result<Option<Vec<R>>, SortError> {
        let payload_len = match self.rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) => {
                return if e.kind() == io::ErrorKind::UnexpectedEof {
                    Ok(None)
                } else {
                    Err(SortError::Io(e))
                };
            }
        };
        let crc = self.rdr.read_u32::<LittleEndian>()?;
        let mut payload = vec![0u8; payload_len as usize];
        self.rdr.read_exact(&mut payload)?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != crc || payload.len() % R::WIDTH != 0 {
            return Err(SortError::Corrupt {
                path: self.path.clone(),
                offset: self.offset,
            });
        }
        self.offset += BLOCK_HEADER_BYTES + payload_len as u64;

        Ok(Some(decode_records(&payload)))
    }

    /// Calls `apply` for every block in file order.
    pub fn for_each_block<R, F>(&mut self, mut apply: F) -> Result<(), SortError>
    where
        R: Record,
        F: FnMut(Vec<R>) -> Result<(), SortError>,
    {
        while let Some(block) = self.next_block::<R>()? {
            apply(block)?;
        }
        Ok(())
    }

    /// Loads the whole run into memory.
    pub fn read_all<R: Record>(&mut self) -> Result<Vec<R>, SortError> {
        let mut out = Vec::new();
        while let Some(block) = self.next_block::<R>()? {
            out.extend_from_slice(&block);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn run_write_and_read_back() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bucket-0.run");

        let mut w = RunWriter::create(&path)?;
        w.append(&[5u64, 3, 9])?;
        w.append::<u64>(&[])?;
        w.append(&[1u64])?;
        assert_eq!(w.records(), 4);
        assert_eq!(w.payload_bytes(), 32);
        assert_eq!(w.finish()?, 4);

        let mut r = RunReader::open(&path)?;
        let mut blocks = Vec::new();
        r.for_each_block::<u64, _>(|b| {
            blocks.push(b);
            Ok(())
        })?;
        assert_eq!(blocks, vec![vec![5, 3, 9], vec![1]]);

        let all: Vec<u64> = RunReader::open(&path)?.read_all()?;
        assert_eq!(all, vec![5, 3, 9, 1]);
        Ok(())
    }

    #[test]
    fn flipped_byte_is_reported_as_corrupt() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bucket-1.run");

        let mut w = RunWriter::create(&path)?;
        w.append(&[42u64, 43])?;
        w.finish()?;

        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes)?;

        let err = RunReader::open(&path)?.read_all::<u64>().unwrap_err();
        assert!(matches!(err, SortError::Corrupt { offset: 0, .. }));
        Ok(())
    }

    #[test]
    fn truncated_block_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bucket-2.run");

        let mut w = RunWriter::create(&path)?;
        w.append(&[1u64, 2, 3])?;
        w.finish()?;

        let bytes = fs::read(&path)?;
        fs::write(&path, &bytes[..bytes.len() - 4])?;

        assert!(RunReader::open(&path)?.read_all::<u64>().is_err());
        Ok(())
    }
}
