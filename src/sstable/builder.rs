//! SSTable writer — builds a complete SSTable file from a sorted sequence
//! of key/record pairs.
//!
//! Layout produced (see [`crate::block`] for the block formats):
//!
//! ```text
//! [data block]...      one per entry, in ascending key order
//! [index entry]...     one 8-byte offset per data block, same order
//! [bloom block]        one bloom filter over every key written
//! [footer]              12 bytes, fixed at the end of the file
//! ```
//!
//! Written atomically: everything lands in a `.tmp` file first, which is
//! `fsync`'d and renamed into place only once complete. An empty input
//! produces no file at all — callers should treat `finish()` returning
//! `None` as "nothing to register".

use crate::block::{BloomBlock, DataBlock, Footer, IndexEntry};
use crate::bloom::Bloom;
use crate::memtable::Record;
use crate::sstable::{SSTableError, filename};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct SstWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
    offset: u32,
    index: Vec<IndexEntry>,
    bloom: Bloom,
    count: usize,
}

impl SstWriter {
    /// Begin writing a new SSTable at level `level`, generation `ts`, under
    /// `dir`. `bloom_bit_len` should come from
    /// [`crate::bloom::bit_length_for_level`].
    pub fn create(dir: &Path, level: u32, ts: u64, bloom_bit_len: u32) -> Result<Self, SSTableError> {
        let final_path = dir.join(filename(level, ts));
        let tmp_path = dir.join(format!("{}_tmp", filename(level, ts)));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Self {
            tmp_path,
            final_path,
            file,
            offset: 0,
            index: Vec::new(),
            bloom: Bloom::new(bloom_bit_len),
            count: 0,
        })
    }

    /// Append one entry. Callers must supply keys in ascending order.
    pub fn add(&mut self, key: &[u8], record: &Record) -> Result<(), SSTableError> {
        let block = DataBlock {
            deleted: record.deleted,
            ts: record.ts,
            key: key.to_vec(),
            value: record.value.clone(),
        };
        let mut buf = Vec::with_capacity(block.encoded_len());
        block.encode_to(&mut buf);
        self.file.write_all(&buf)?;

        self.index.push(IndexEntry { offset: self.offset });
        self.offset += buf.len() as u32;
        self.bloom.add(key);
        self.count += 1;
        Ok(())
    }

    /// Write the data index, bloom filter, and footer, then commit the file.
    /// Returns `None` (and removes the temp file) if no entries were added.
    pub fn finish(mut self) -> Result<Option<PathBuf>, SSTableError> {
        if self.count == 0 {
            drop(self.file);
            std::fs::remove_file(&self.tmp_path)?;
            return Ok(None);
        }

        let data_index_start = self.offset;
        for entry in &self.index {
            let mut buf = Vec::new();
            entry.encode_to(&mut buf);
            self.file.write_all(&buf)?;
            self.offset += buf.len() as u32;
        }

        let bloom_filter_position = self.offset;
        let bloom_block = BloomBlock {
            bit_len: self.bloom.bit_len(),
            bytes: self.bloom.to_bytes(),
        };
        let mut buf = Vec::new();
        bloom_block.encode_to(&mut buf);
        self.file.write_all(&buf)?;

        let footer = Footer {
            data_index_start,
            bloom_filter_position,
        };
        let mut buf = Vec::new();
        footer.encode_to(&mut buf);
        self.file.write_all(&buf)?;

        self.file.sync_all()?;
        drop(self.file);
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(Some(self.final_path))
    }
}
