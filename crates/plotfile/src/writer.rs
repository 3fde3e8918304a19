use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{FormatError, Result};
use crate::format::{
    write_directory, write_header, Directory, PlotHeader, PositionsEntry, TableEntry,
    CHECKSUM_OFFSET, DATA_START, FORMAT_VERSION, MAX_PLOT_K, TABLE_COUNT,
};
use crate::index::{index_bytes, write_index};
use crate::packed::packed_bytes;
use crate::park::{ParkSummary, PARK_BYTES};
use crate::reader::PlotReader;

/// Parks of one table, already written to a scratch file.
#[derive(Debug, Clone)]
pub struct TableSource {
    pub summary: ParkSummary,
    pub parks_path: PathBuf,
}

/// Packed root positions, already written to a scratch file.
#[derive(Debug, Clone)]
pub struct PositionsSource {
    pub entries: u64,
    pub bits: u8,
    pub path: PathBuf,
}

/// Everything that goes into one plot file.
#[derive(Debug, Clone)]
pub struct PlotContents {
    pub k: u8,
    pub plot_id: [u8; 32],
    pub public_key: [u8; 32],
    /// Tables 1..=7 in order.
    pub tables: Vec<TableSource>,
    pub positions: PositionsSource,
}

/// Computes every section offset and the total file size.
pub fn layout(contents: &PlotContents) -> Result<(Directory, u64)> {
    if contents.tables.len() != TABLE_COUNT {
        return Err(FormatError::InvalidLayout(format!(
            "expected {TABLE_COUNT} tables, got {}",
            contents.tables.len()
        )));
    }
    if contents.k == 0 || contents.k > MAX_PLOT_K {
        return Err(FormatError::InvalidLayout(format!(
            "k = {} is outside 1..={MAX_PLOT_K}",
            contents.k
        )));
    }
    let mut dir = Directory::default();
    let mut offset = DATA_START;

    for (entry, source) in dir.tables.iter_mut().zip(&contents.tables) {
        *entry = TableEntry {
            entries: source.summary.entries,
            park_count: source.summary.park_count(),
            index_offset: offset,
            parks_offset: 0,
            stub_bits: source.summary.stub_bits,
        };
        offset += index_bytes(entry.park_count);
    }
    for entry in dir.tables.iter_mut() {
        entry.parks_offset = offset;
        offset += entry.park_count * PARK_BYTES as u64;
    }
    dir.positions = PositionsEntry {
        offset,
        entries: contents.positions.entries,
        bits: contents.positions.bits,
    };
    offset += packed_bytes(contents.positions.entries, contents.positions.bits);

    Ok((dir, offset))
}

/// Write adapter that feeds every byte through crc32.
struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: Crc32,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Crc32::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Serializes a plot file.
///
/// Stateless, like the rest of the write path: everything happens inside
/// [`write_plot`](PlotWriter::write_plot).
pub struct PlotWriter {}

impl PlotWriter {
    /// Writes `contents` to `path` and returns the file size.
    ///
    /// # File Layout
    ///
    /// ```text
    /// [HEADER]     88 bytes, checksum patched in last
    /// [DIRECTORY]  7 table entries + positions entry
    /// [INDEX]      level 1 + level 2 checkpoints, tables 1..=7
    /// [PARKS]      fixed-size parks, tables 1..=7
    /// [POSITIONS]  bit-packed root positions
    /// ```
    ///
    /// # Crash Safety
    ///
    /// Writes to `path.plot.tmp`, calls `sync_all()`, optionally re-reads the
    /// file to verify the checksum, then atomically renames. On any error the
    /// temp file is removed and nothing appears at `path`.
    pub fn write_plot(path: &Path, contents: &PlotContents, verify: bool) -> Result<u64> {
        let tmp_path = path.with_extension("plot.tmp");
        let result = Self::write_tmp(&tmp_path, contents).and_then(|total| {
            if verify {
                PlotReader::open(&tmp_path)?.verify_checksum()?;
            }
            fs::rename(&tmp_path, path)?;
            Ok(total)
        });

        match result {
            Ok(total) => {
                debug!(path = %path.display(), bytes = total, "plot file committed");
                Ok(total)
            }
            Err(e) => {
                warn!(path = %tmp_path.display(), error = %e, "discarding partial plot file");
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_tmp(tmp_path: &Path, contents: &PlotContents) -> Result<u64> {
        let (dir, total) = layout(contents)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut out = ChecksumWriter::new(BufWriter::with_capacity(1 << 20, file));

        let header = PlotHeader {
            version: FORMAT_VERSION,
            k: contents.k,
            plot_id: contents.plot_id,
            public_key: contents.public_key,
            checksum: 0,
            park_bytes: PARK_BYTES as u32,
            total_size: total,
        };
        write_header(&mut out, &header)?;
        write_directory(&mut out, &dir)?;

        for source in &contents.tables {
            write_index(&mut out, &source.summary.checkpoints)?;
        }
        for source in &contents.tables {
            copy_exact(&source.parks_path, source.summary.parks_bytes(), &mut out)?;
        }
        copy_exact(
            &contents.positions.path,
            packed_bytes(contents.positions.entries, contents.positions.bits),
            &mut out,
        )?;

        if out.written != total {
            return Err(FormatError::InvalidLayout(format!(
                "wrote {} bytes, layout expects {}",
                out.written, total
            )));
        }

        let checksum = out.hasher.finalize();
        let mut file = out.inner.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(CHECKSUM_OFFSET))?;
        file.write_u32::<LittleEndian>(checksum)?;
        file.flush()?;
        file.sync_all()?;

        Ok(total)
    }
}

fn copy_exact<W: Write>(path: &Path, expected: u64, out: &mut W) -> Result<()> {
    let mut src = File::open(path)?.take(expected);
    let copied = io::copy(&mut src, out)?;
    if copied != expected {
        return Err(FormatError::InvalidLayout(format!(
            "{} holds {} bytes, expected {}",
            path.display(),
            copied,
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::{read_header, HEADER_BYTES};
    use crate::packed::PackedWriter;
    use crate::park::encode_parks;
    use anyhow::Result;
    use std::path::Path;
    use tempfile::tempdir;

    pub(crate) fn sample_contents(dir: &Path) -> Result<PlotContents> {
        let mut tables = Vec::new();
        for t in 1..=7u64 {
            let values: Vec<u64> = (0..3_000u64).map(|i| i * (t * 1_000) + t).collect();
            let (parks, summary) = encode_parks(&values, 10)?;
            let parks_path = dir.join(format!("t{t}.parks"));
            std::fs::write(&parks_path, parks)?;
            tables.push(TableSource { summary, parks_path });
        }
        let mut w = PackedWriter::new(Vec::new(), 12);
        for i in 0..3_000u64 {
            w.push((i * 31) % 3_000)?;
        }
        let (bytes, entries) = w.finish()?;
        let path = dir.join("positions");
        std::fs::write(&path, bytes)?;
        Ok(PlotContents {
            k: 12,
            plot_id: [1u8; 32],
            public_key: [2u8; 32],
            tables,
            positions: PositionsSource {
                entries,
                bits: 12,
                path,
            },
        })
    }

    #[test]
    fn write_and_inspect_header() -> Result<()> {
        let dir = tempdir()?;
        let contents = sample_contents(dir.path())?;
        let path = dir.path().join("test.plot");

        let total = PlotWriter::write_plot(&path, &contents, true)?;
        assert_eq!(std::fs::metadata(&path)?.len(), total);
        assert!(!path.with_extension("plot.tmp").exists());

        let mut f = File::open(&path)?;
        let header = read_header(&mut f)?;
        assert_eq!(header.k, 12);
        assert_eq!(header.total_size, total);
        assert_eq!(header.park_bytes, PARK_BYTES as u32);
        assert_ne!(header.checksum, 0);
        assert!(total > HEADER_BYTES);
        Ok(())
    }

    #[test]
    fn layout_sections_are_gapless() -> Result<()> {
        let dir = tempdir()?;
        let contents = sample_contents(dir.path())?;
        let (directory, total) = layout(&contents)?;

        let mut expected = DATA_START;
        for t in &directory.tables {
            assert_eq!(t.index_offset, expected);
            expected += index_bytes(t.park_count);
        }
        for t in &directory.tables {
            assert_eq!(t.parks_offset, expected);
            expected += t.park_count * PARK_BYTES as u64;
        }
        assert_eq!(directory.positions.offset, expected);
        assert_eq!(total, expected + packed_bytes(3_000, 12));
        Ok(())
    }

    #[test]
    fn short_parks_file_leaves_nothing_behind() -> Result<()> {
        let dir = tempdir()?;
        let contents = sample_contents(dir.path())?;
        let truncated = &contents.tables[3].parks_path;
        let bytes = std::fs::read(truncated)?;
        std::fs::write(truncated, &bytes[..bytes.len() / 2])?;

        let path = dir.path().join("broken.plot");
        assert!(PlotWriter::write_plot(&path, &contents, false).is_err());
        assert!(!path.exists());
        assert!(!path.with_extension("plot.tmp").exists());
        Ok(())
    }

    #[test]
    fn failed_rename_leaves_nothing_behind() -> Result<()> {
        let dir = tempdir()?;
        let contents = sample_contents(dir.path())?;
        // A non-empty directory cannot be replaced by a file.
        let path = dir.path().join("taken.plot");
        std::fs::create_dir(&path)?;
        std::fs::write(path.join("occupant"), b"x")?;

        assert!(matches!(
            PlotWriter::write_plot(&path, &contents, true),
            Err(FormatError::Io(_))
        ));
        assert!(path.is_dir());
        assert!(!path.with_extension("plot.tmp").exists());
        Ok(())
    }

    #[test]
    fn out_of_range_k_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let mut contents = sample_contents(dir.path())?;
        contents.k = MAX_PLOT_K + 1;
        assert!(layout(&contents).is_err());
        contents.k = 0;
        assert!(layout(&contents).is_err());
        Ok(())
    }

    #[test]
    fn wrong_table_count_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let mut contents = sample_contents(dir.path())?;
        contents.tables.pop();
        assert!(layout(&contents).is_err());
        Ok(())
    }
}
