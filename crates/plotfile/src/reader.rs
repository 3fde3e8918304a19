use crc32fast::Hasher as Crc32;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{FormatError, Result};
use crate::format::{
    read_directory, read_header, Directory, PlotHeader, TableEntry, CHECKSUM_OFFSET, DATA_START,
    MAX_PLOT_K, TABLE_COUNT,
};
use crate::index::{index_bytes, level2_len, Checkpoint, IndexLevels, CHECKPOINT_BYTES};
use crate::packed::{packed_bytes, packed_span, unpack_entry};
use crate::park::{decode_park, PARK_BYTES};

/// Read-only access to a finished plot file.
///
/// On [`open`](PlotReader::open) the header, the directory and every table's
/// level-2 index are loaded into memory. Everything else is read on demand;
/// like the rest of the read path, each lookup opens its own file handle so
/// the reader can be shared freely.
pub struct PlotReader {
    path: PathBuf,
    header: PlotHeader,
    directory: Directory,
    levels: Vec<IndexLevels>,
}

impl PlotReader {
    /// Opens a plot file and validates its structure.
    ///
    /// # Validation
    ///
    /// - The file must hold at least the header and directory.
    /// - Magic, version and table count must match.
    /// - `k` must lie in `1..=MAX_PLOT_K`.
    /// - `total_size` must equal the file size and every section must lie
    ///   inside the file.
    ///
    /// The checksum is not verified here; see
    /// [`verify_checksum`](PlotReader::verify_checksum).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path)?;
        let filesize = f.metadata()?.len();
        if filesize < DATA_START {
            return Err(FormatError::FileTooSmall(filesize));
        }

        let header = read_header(&mut f)?;
        if header.total_size != filesize {
            return Err(FormatError::InvalidLayout(format!(
                "header says {} bytes, file has {}",
                header.total_size, filesize
            )));
        }
        if header.k == 0 || header.k > MAX_PLOT_K {
            return Err(FormatError::InvalidLayout(format!(
                "k = {} is outside 1..={MAX_PLOT_K}",
                header.k
            )));
        }
        if header.park_bytes as usize != PARK_BYTES {
            return Err(FormatError::InvalidLayout(format!(
                "park size {} is not supported",
                header.park_bytes
            )));
        }
        let directory = read_directory(&mut f)?;
        validate_directory(&directory, filesize)?;

        let mut levels = Vec::with_capacity(TABLE_COUNT);
        for t in &directory.tables {
            let count = level2_len(t.park_count);
            let offset = t.index_offset + t.park_count * CHECKPOINT_BYTES;
            let mut buf = vec![0u8; (count * CHECKPOINT_BYTES) as usize];
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(&mut buf)?;
            levels.push(IndexLevels::new(t.park_count, Checkpoint::decode_all(&buf)));
        }

        Ok(Self {
            path,
            header,
            directory,
            levels,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &PlotHeader {
        &self.header
    }

    pub fn k(&self) -> u8 {
        self.header.k
    }

    pub fn plot_id(&self) -> &[u8; 32] {
        &self.header.plot_id
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Directory entry for `table` (1..=7).
    pub fn table(&self, table: u8) -> Result<&TableEntry> {
        table_slot(table).map(|i| &self.directory.tables[i])
    }

    pub fn table_len(&self, table: u8) -> Result<u64> {
        Ok(self.table(table)?.entries)
    }

    /// Number of root entries, which is also the number of positions.
    pub fn root_len(&self) -> u64 {
        self.directory.positions.entries
    }

    /// Streams the whole file through crc32 with the checksum field zeroed
    /// and compares against the header.
    pub fn verify_checksum(&self) -> Result<()> {
        let mut f = File::open(&self.path)?;
        let mut hasher = Crc32::new();
        let mut buf = vec![0u8; 1 << 20];
        let mut offset = 0u64;
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &mut buf[..n];
            let start = CHECKSUM_OFFSET.saturating_sub(offset) as usize;
            let end = (CHECKSUM_OFFSET + 4).saturating_sub(offset).min(n as u64) as usize;
            if start < end {
                chunk[start..end].fill(0);
            }
            hasher.update(chunk);
            offset += n as u64;
        }
        let computed = hasher.finalize();
        if computed != self.header.checksum {
            return Err(FormatError::ChecksumMismatch {
                stored: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }

    fn read_level1(&self, table: u8, start: u64, count: u64) -> Result<Vec<Checkpoint>> {
        let entry = self.table(table)?;
        let mut buf = vec![0u8; (count * CHECKPOINT_BYTES) as usize];
        self.read_at(entry.index_offset + start * CHECKPOINT_BYTES, &mut buf)?;
        Ok(Checkpoint::decode_all(&buf))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf)?;
        Ok(())
    }

    /// Decodes park `park` of `table`.
    pub fn read_park(&self, table: u8, park: u64) -> Result<Vec<u64>> {
        let entry = *self.table(table)?;
        if park >= entry.park_count {
            return Err(FormatError::Corrupt(format!(
                "park {park} requested, table {table} has {}",
                entry.park_count
            )));
        }
        let mut buf = vec![0u8; PARK_BYTES];
        self.read_at(entry.parks_offset + park * PARK_BYTES as u64, &mut buf)?;
        decode_park(&buf, entry.stub_bits)
    }

    /// First park of `table` that can hold `value`, with its checkpoint.
    pub fn find_park_by_value(&self, table: u8, value: u64) -> Result<(u64, Checkpoint)> {
        let slot = table_slot(table)?;
        if self.levels[slot].parks() == 0 {
            return Err(FormatError::OutOfRange {
                table,
                position: 0,
                len: 0,
            });
        }
        self.levels[slot].seek_value(value, |start, count| self.read_level1(table, start, count))
    }

    /// The park of `table` holding `position`, with its checkpoint.
    pub fn find_park_by_position(&self, table: u8, position: u64) -> Result<(u64, Checkpoint)> {
        let slot = table_slot(table)?;
        let len = self.directory.tables[slot].entries;
        if position >= len {
            return Err(FormatError::OutOfRange {
                table,
                position,
                len,
            });
        }
        self.levels[slot].seek_position(position, |start, count| {
            self.read_level1(table, start, count)
        })
    }

    /// Value stored at `position` of `table`.
    pub fn value_at(&self, table: u8, position: u64) -> Result<u64> {
        let (park, checkpoint) = self.find_park_by_position(table, position)?;
        let values = self.read_park(table, park)?;
        values
            .get((position - checkpoint.position) as usize)
            .copied()
            .ok_or_else(|| {
                FormatError::Corrupt(format!(
                    "park {park} of table {table} does not reach position {position}"
                ))
            })
    }

    /// Every position of `table` holding `value`, ascending. Empty when the
    /// value is absent.
    pub fn lookup(&self, table: u8, value: u64) -> Result<Vec<u64>> {
        let entry = *self.table(table)?;
        if entry.entries == 0 {
            return Ok(Vec::new());
        }
        let (mut park, checkpoint) = self.find_park_by_value(table, value)?;
        let mut position = checkpoint.position;
        let mut found = Vec::new();
        while park < entry.park_count {
            let values = self.read_park(table, park)?;
            if values[0] > value {
                break;
            }
            for v in &values {
                if *v == value {
                    found.push(position);
                } else if *v > value {
                    return Ok(found);
                }
                position += 1;
            }
            park += 1;
        }
        Ok(found)
    }

    pub fn contains(&self, table: u8, value: u64) -> Result<bool> {
        Ok(!self.lookup(table, value)?.is_empty())
    }

    /// Root position `index`: where root entry `index` lives in table 6.
    pub fn position_at(&self, index: u64) -> Result<u64> {
        let positions = self.directory.positions;
        if index >= positions.entries {
            return Err(FormatError::OutOfRange {
                table: TABLE_COUNT as u8,
                position: index,
                len: positions.entries,
            });
        }
        let (start, end, bit_offset) = packed_span(index, positions.bits);
        let mut buf = vec![0u8; (end - start) as usize];
        self.read_at(positions.offset + start, &mut buf)?;
        unpack_entry(&buf, bit_offset, positions.bits)
    }
}

fn table_slot(table: u8) -> Result<usize> {
    if table == 0 || table as usize > TABLE_COUNT {
        return Err(FormatError::InvalidTable(table));
    }
    Ok(table as usize - 1)
}

fn validate_directory(dir: &Directory, filesize: u64) -> Result<()> {
    for (i, t) in dir.tables.iter().enumerate() {
        let index_end = t.index_offset.checked_add(index_bytes(t.park_count));
        let parks_end = t
            .park_count
            .checked_mul(PARK_BYTES as u64)
            .and_then(|n| n.checked_add(t.parks_offset));
        let in_bounds = t.index_offset >= DATA_START
            && index_end.is_some_and(|end| end <= filesize)
            && parks_end.is_some_and(|end| end <= filesize);
        if !in_bounds {
            return Err(FormatError::InvalidLayout(format!(
                "table {} sections exceed the file",
                i + 1
            )));
        }
        if (t.entries == 0) != (t.park_count == 0) || t.park_count > t.entries {
            return Err(FormatError::InvalidLayout(format!(
                "table {} has {} entries in {} parks",
                i + 1,
                t.entries,
                t.park_count
            )));
        }
    }
    let p = dir.positions;
    let positions_end = p.offset.checked_add(packed_bytes(p.entries, p.bits));
    if p.bits > 64 || !positions_end.is_some_and(|end| end <= filesize) {
        return Err(FormatError::InvalidLayout(
            "positions section exceeds the file".into(),
        ));
    }
    Ok(())
}
