//! Streaming data-block reader used by compaction.
//!
//! [`DataBlockStream`] walks the data-block region of one SSTable file
//! sequentially, yielding `(key, Record)` pairs in on-disk (ascending key)
//! order. It stops at the data index, ignoring the index/bloom/footer
//! region entirely — compaction only ever needs the raw entries.

use crate::block::{self, DataBlock, Footer};
use crate::memtable::Record;
use crate::sstable::SSTableError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub struct DataBlockStream {
    file: File,
    offset: u32,
    end: u32,
    current: Option<(Vec<u8>, Record)>,
}

impl DataBlockStream {
    pub fn open(path: &Path) -> Result<Self, SSTableError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::End(-(block::FOOTER_SIZE as i64)))?;
        let mut buf = [0u8; block::FOOTER_SIZE];
        file.read_exact(&mut buf)?;
        let footer = Footer::decode_from(&buf)?;

        let mut stream = Self {
            file,
            offset: 0,
            end: footer.data_index_start,
            current: None,
        };
        stream.advance()?;
        Ok(stream)
    }

    fn advance(&mut self) -> Result<(), SSTableError> {
        if self.offset >= self.end {
            self.current = None;
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.offset as u64))?;
        let mut header = [0u8; block::DATA_BLOCK_HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        let (deleted, ts, key_len, value_len, checksum) = DataBlock::decode_header(&header)?;

        let mut key = vec![0u8; key_len];
        self.file.read_exact(&mut key)?;
        let mut value = vec![0u8; value_len];
        self.file.read_exact(&mut value)?;
        if block::checksum32(&value) != checksum {
            return Err(SSTableError::Corrupt(
                "data block checksum mismatch during scan".into(),
            ));
        }

        self.offset += (block::DATA_BLOCK_HEADER_SIZE + key_len + value_len) as u32;
        self.current = Some((key, Record { deleted, ts, value }));
        Ok(())
    }

    /// The current entry, without consuming it.
    pub fn peek(&self) -> Option<&(Vec<u8>, Record)> {
        self.current.as_ref()
    }

    /// Consume and return the current entry, advancing to the next one.
    pub fn pop(&mut self) -> Result<Option<(Vec<u8>, Record)>, SSTableError> {
        let current = self.current.take();
        self.advance()?;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::bit_length_for_level;
    use crate::sstable::SstWriter;
    use tempfile::tempdir;

    #[test]
    fn stream_yields_entries_in_written_order() {
        let dir = tempdir().unwrap();
        let mut writer = SstWriter::create(dir.path(), 0, 1, bit_length_for_level(0)).unwrap();
        writer.add(b"a", &Record::put(b"1".to_vec(), 1)).unwrap();
        writer.add(b"b", &Record::put(b"2".to_vec(), 2)).unwrap();
        writer.add(b"c", &Record::tombstone(3)).unwrap();
        let path = writer.finish().unwrap().unwrap();

        let mut stream = DataBlockStream::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some((k, r)) = stream.pop().unwrap() {
            seen.push((k, r.deleted, r.value));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), false, b"1".to_vec()),
                (b"b".to_vec(), false, b"2".to_vec()),
                (b"c".to_vec(), true, Vec::new()),
            ]
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let dir = tempdir().unwrap();
        let mut writer = SstWriter::create(dir.path(), 0, 1, bit_length_for_level(0)).unwrap();
        writer.add(b"only", &Record::put(b"v".to_vec(), 1)).unwrap();
        let path = writer.finish().unwrap().unwrap();

        let mut stream = DataBlockStream::open(&path).unwrap();
        assert_eq!(stream.peek().unwrap().0, b"only");
        assert_eq!(stream.peek().unwrap().0, b"only");
        let popped = stream.pop().unwrap().unwrap();
        assert_eq!(popped.0, b"only");
        assert!(stream.peek().is_none());
    }
}
