//! Sorted String Table (SSTable): an immutable, on-disk sorted run of
//! key/record pairs produced by flushing a memtable or by compaction.
//!
//! # On-disk layout
//!
//! ```text
//! [data block]...    one per entry, ascending key order
//! [index entry]...   one 8-byte offset per data block, same order
//! [bloom block]       one bloom filter over every key
//! [footer]             12 bytes, fixed at the end of the file
//! ```
//!
//! Filenames follow `sst_<level>_<ts>`. A zero-byte file (the result of
//! flushing an empty memtable) is never opened as a table.
//!
//! Reads go through a small pool of independently-seekable file handles
//! ([`pool::ReaderPool`]) rather than a memory map, so the number of
//! concurrently in-flight reads against one table is bounded and explicit.

mod builder;
mod iterator;
mod pool;

pub use builder::SstWriter;
pub use iterator::DataBlockStream;

use crate::block::{self, BlockError, DataBlock, Footer, IndexEntry};
use crate::bloom::Bloom;
use crate::memtable::Record;
use pool::ReaderPool;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SSTableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("corrupt SSTable: {0}")]
    Corrupt(String),

    #[error("internal error: index search made no progress")]
    NoProgress,

    #[error("invalid SSTable filename: {0}")]
    InvalidFilename(String),
}

fn to_io_err(e: BlockError) -> io::Error {
    io::Error::other(e.to_string())
}

/// File-naming convention: `sst_<level>_<ts>`.
pub fn filename(level: u32, ts: u64) -> String {
    format!("sst_{level}_{ts}")
}

/// Parse the `(level, ts)` pair embedded in an SSTable filename.
pub fn parse_filename(path: &Path) -> Result<(u32, u64), SSTableError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SSTableError::InvalidFilename(path.display().to_string()))?;
    let rest = name
        .strip_prefix("sst_")
        .ok_or_else(|| SSTableError::InvalidFilename(name.to_string()))?;
    let (level_str, ts_str) = rest
        .split_once('_')
        .ok_or_else(|| SSTableError::InvalidFilename(name.to_string()))?;
    let level: u32 = level_str
        .parse()
        .map_err(|_| SSTableError::InvalidFilename(name.to_string()))?;
    let ts: u64 = ts_str
        .parse()
        .map_err(|_| SSTableError::InvalidFilename(name.to_string()))?;
    Ok((level, ts))
}

/// Enumerate SSTable files directly under `dir`, ignoring zero-byte files
/// and in-progress `.tmp` writes.
pub fn discover(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("sst_") || name.ends_with("_tmp") {
            continue;
        }
        if entry.metadata()?.len() == 0 {
            warn!(name, "skipping zero-byte SSTable file");
            continue;
        }
        found.push(entry.path());
    }
    Ok(found)
}

/// A reader over one immutable SSTable file.
pub struct SSTable {
    path: PathBuf,
    level: u32,
    ts: u64,
    pool: ReaderPool,
    bloom: Bloom,
    footer: Footer,
    index_offsets: OnceLock<Vec<u32>>,
}

impl SSTable {
    /// Open `path` with a pool of `reader_count` read handles. Returns
    /// `Ok(None)` for a zero-byte file rather than an error: that is the
    /// well-formed result of flushing an empty memtable, and callers should
    /// simply not register it.
    pub fn open(path: PathBuf, reader_count: usize) -> Result<Option<Self>, SSTableError> {
        let meta = std::fs::metadata(&path)?;
        if meta.len() == 0 {
            return Ok(None);
        }
        let (level, ts) = parse_filename(&path)?;
        let pool = ReaderPool::open(&path, reader_count)?;

        let footer = pool.with_handle(|file| {
            file.seek(SeekFrom::End(-(block::FOOTER_SIZE as i64)))?;
            let mut buf = [0u8; block::FOOTER_SIZE];
            file.read_exact(&mut buf)?;
            Footer::decode_from(&buf).map_err(to_io_err)
        })?;

        let bloom_len = meta
            .len()
            .saturating_sub(block::FOOTER_SIZE as u64)
            .saturating_sub(footer.bloom_filter_position as u64);
        let bloom_block = pool.with_handle(|file| {
            file.seek(SeekFrom::Start(footer.bloom_filter_position as u64))?;
            let mut buf = vec![0u8; bloom_len as usize];
            file.read_exact(&mut buf)?;
            let (block, _) = block::BloomBlock::decode_from(&buf).map_err(to_io_err)?;
            Ok(block)
        })?;
        let bloom = Bloom::from_bytes(bloom_block.bit_len, &bloom_block.bytes);

        debug!(path = %path.display(), level, ts, "opened SSTable");
        Ok(Some(Self {
            path,
            level,
            ts,
            pool,
            bloom,
            footer,
            index_offsets: OnceLock::new(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    fn index_offsets(&self) -> Result<&Vec<u32>, SSTableError> {
        if let Some(offsets) = self.index_offsets.get() {
            return Ok(offsets);
        }
        let count = ((self.footer.bloom_filter_position - self.footer.data_index_start) as usize)
            / block::INDEX_ENTRY_SIZE;
        let offsets = self.pool.with_handle(|file| {
            file.seek(SeekFrom::Start(self.footer.data_index_start as u64))?;
            let mut buf = vec![0u8; count * block::INDEX_ENTRY_SIZE];
            file.read_exact(&mut buf)?;
            let mut offsets = Vec::with_capacity(count);
            for chunk in buf.chunks_exact(block::INDEX_ENTRY_SIZE) {
                let (entry, _) = IndexEntry::decode_from(chunk).map_err(to_io_err)?;
                offsets.push(entry.offset);
            }
            Ok(offsets)
        })?;
        // If another caller raced us, `set` loses silently and we read back
        // whichever one won: both are identical, deterministically derived
        // from the same immutable file.
        let _ = self.index_offsets.set(offsets);
        Ok(self.index_offsets.get().expect("just set or set by racer"))
    }

    /// Look up `key`. Returns `None` for a definitive miss (bloom filter
    /// excludes it, or the index search bottoms out without a match).
    pub fn get_by_key(&self, key: &[u8]) -> Result<Option<Record>, SSTableError> {
        if !self.bloom.might_contain(key) {
            return Ok(None);
        }
        let offsets = self.index_offsets()?;
        if offsets.is_empty() {
            return Ok(None);
        }

        let max_iters = (offsets.len().ilog2() as usize + 2) * 2;
        let result = self.pool.with_handle(|file| {
            let mut lo = 0i64;
            let mut hi = offsets.len() as i64 - 1;
            let mut prev_mid: Option<i64> = None;
            let mut iters = 0usize;

            while lo <= hi {
                iters += 1;
                if iters > max_iters {
                    return Err(io::Error::other("index search exceeded iteration bound"));
                }
                let mid = lo + (hi - lo) / 2;
                if prev_mid == Some(mid) {
                    return Err(io::Error::other("index search made no progress"));
                }
                prev_mid = Some(mid);

                let offset = offsets[mid as usize];
                file.seek(SeekFrom::Start(offset as u64))?;
                let mut header = [0u8; block::DATA_BLOCK_HEADER_SIZE];
                file.read_exact(&mut header)?;
                let (deleted, ts, key_len, value_len, checksum) =
                    DataBlock::decode_header(&header).map_err(to_io_err)?;
                let mut candidate = vec![0u8; key_len];
                file.read_exact(&mut candidate)?;

                match candidate.as_slice().cmp(key) {
                    std::cmp::Ordering::Equal => {
                        let mut value = vec![0u8; value_len];
                        file.read_exact(&mut value)?;
                        if block::checksum32(&value) != checksum {
                            return Err(io::Error::other("data block checksum mismatch"));
                        }
                        return Ok(Some(Record { deleted, ts, value }));
                    }
                    std::cmp::Ordering::Less => lo = mid + 1,
                    std::cmp::Ordering::Greater => hi = mid - 1,
                }
            }
            Ok(None)
        });

        match result {
            Ok(r) => Ok(r),
            Err(e) if e.to_string().contains("no progress") || e.to_string().contains("iteration bound") => {
                Err(SSTableError::NoProgress)
            }
            Err(e) => Err(SSTableError::Io(e)),
        }
    }

    /// Close the underlying reader pool, blocking until all outstanding
    /// borrows return.
    pub fn close(self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::bit_length_for_level;
    use tempfile::tempdir;

    fn build_table(dir: &Path, level: u32, ts: u64, entries: &[(&str, &str)]) -> PathBuf {
        let mut writer = SstWriter::create(dir, level, ts, bit_length_for_level(level)).unwrap();
        for (k, v) in entries {
            writer.add(k.as_bytes(), &Record::put(v.as_bytes().to_vec(), ts)).unwrap();
        }
        writer.finish().unwrap().unwrap()
    }

    #[test]
    fn get_by_key_finds_every_entry() {
        let dir = tempdir().unwrap();
        let entries: Vec<(String, String)> =
            (0..200).map(|i| (format!("k{i:04}"), format!("v{i}"))).collect();
        let as_str: Vec<(&str, &str)> =
            entries.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let path = build_table(dir.path(), 0, 1, &as_str);

        let table = SSTable::open(path, 4).unwrap().unwrap();
        for (k, v) in &entries {
            let got = table.get_by_key(k.as_bytes()).unwrap().unwrap();
            assert_eq!(got.value, v.as_bytes());
        }
        assert!(table.get_by_key(b"nonexistent").unwrap().is_none());
    }

    #[test]
    fn zero_byte_file_opens_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(filename(0, 1));
        std::fs::write(&path, []).unwrap();
        assert!(SSTable::open(path, 2).unwrap().is_none());
    }

    #[test]
    fn filename_round_trips() {
        let path = Path::new("/tmp/sst_3_555");
        assert_eq!(parse_filename(path).unwrap(), (3, 555));
    }

    #[test]
    fn discover_skips_zero_byte_and_tmp_files() {
        let dir = tempdir().unwrap();
        build_table(dir.path(), 0, 1, &[("a", "1")]);
        std::fs::write(dir.path().join(filename(0, 2)), []).unwrap();
        std::fs::write(dir.path().join("sst_0_3_tmp"), b"partial").unwrap();

        let found = discover(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], dir.path().join(filename(0, 1)));
    }
}
