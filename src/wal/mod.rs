//! Write-ahead log: an append-only file of [`Action`]s, replayed into a
//! fresh memtable on open.
//!
//! Unlike a general-purpose WAL wrapping arbitrary serializable records
//! behind a length-prefixed frame, this WAL is a flat sequence of
//! self-describing [`Action`] records — each one already carries its own
//! length (via its key/value length fields) and checksum, so no outer
//! framing is needed.

use crate::block::{Action, BlockError, Op};
use crate::memtable::{Memtable, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("WAL file truncated mid-record at offset {offset}")]
    Truncated { offset: u64 },

    #[error("invalid WAL filename: {0}")]
    InvalidFilename(String),
}

/// File-naming convention: `wal_<ts>`.
pub fn filename(ts: u64) -> String {
    format!("wal_{ts}")
}

/// Parse the timestamp embedded in a WAL filename, if it matches the
/// `wal_<ts>` pattern.
pub fn parse_ts(name: &str) -> Option<u64> {
    name.strip_prefix("wal_")?.parse().ok()
}

/// An append-only WAL file with an atomically tracked byte size.
pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
    ts: u64,
    size: AtomicU64,
}

impl Wal {
    /// Create a new, empty WAL file `wal_<ts>` under `dir`.
    pub fn create(dir: &Path, ts: u64) -> Result<Self, WalError> {
        let path = dir.join(filename(ts));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        debug!(path = %path.display(), "created new WAL");
        Ok(Self {
            file: Mutex::new(file),
            path,
            ts,
            size: AtomicU64::new(0),
        })
    }

    /// Open an existing WAL file for further appends, picking up its
    /// current size from the filesystem.
    pub fn open_existing(path: PathBuf, ts: u64) -> Result<Self, WalError> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            path,
            ts,
            size: AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Current byte size of the WAL, tracked from the length of each
    /// successful append rather than re-`stat`-ing the file.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Append one action, returning once it is written and flushed to disk.
    pub fn append(&self, action: &Action) -> Result<(), WalError> {
        let mut buf = Vec::new();
        action.encode_to(&mut buf);

        let mut file = self.file.lock().expect("WAL file lock poisoned");
        file.write_all(&buf)?;
        file.sync_data()?;
        self.size.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    pub fn close(&self) -> Result<(), WalError> {
        self.file.lock().expect("WAL file lock poisoned").sync_all()?;
        Ok(())
    }

    /// Close and remove this WAL's file. Called once its contents are
    /// durably present in a committed SSTable.
    pub fn delete_file(self) -> Result<(), WalError> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "deleted WAL after flush");
        Ok(())
    }

    /// Replay every action in `path` into a fresh memtable, in order.
    ///
    /// Any non-EOF error aborts the replay. A short read in the middle of a
    /// record (the file ends before a complete action could be decoded) is
    /// treated as fatal: the WAL is expected to be a complete sequence of
    /// whole records, since every append is followed by a sync.
    pub fn replay(path: &Path) -> Result<Memtable, WalError> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let memtable = Memtable::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            match Action::decode_from(&bytes[offset..]) {
                Ok((action, consumed)) => {
                    let record = match action.op {
                        Op::Put => Record::put(action.value, action.ts),
                        Op::Delete => Record::tombstone(action.ts),
                    };
                    memtable.put(action.key, record);
                    offset += consumed;
                }
                Err(BlockError::Encoding(_)) => {
                    // Not enough bytes remained to decode a complete action,
                    // whether the break fell in the header or partway through
                    // the key/value body: a torn trailing write, not
                    // corruption within a record we'd already committed to
                    // decoding.
                    return Err(WalError::Truncated {
                        offset: offset as u64,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(memtable)
    }
}

/// Enumerate WAL files directly under `dir`, returning `(ts, path)` pairs
/// sorted newest-first.
pub fn discover(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(ts) = parse_ts(name) {
            found.push((ts, entry.path()));
        } else if name.starts_with("wal_") {
            warn!(name, "ignoring WAL-like filename that failed to parse");
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_replay_round_trips_puts_and_deletes() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(dir.path(), 1).unwrap();
        wal.append(&Action::new_put(b"a".to_vec(), b"1".to_vec(), 10)).unwrap();
        wal.append(&Action::new_put(b"b".to_vec(), b"2".to_vec(), 11)).unwrap();
        wal.append(&Action::new_delete(b"a".to_vec(), 12)).unwrap();
        let path = wal.path().to_path_buf();
        wal.close().unwrap();

        let memtable = Wal::replay(&path).unwrap();
        assert!(memtable.get(b"a").unwrap().deleted);
        assert_eq!(memtable.get(b"b").unwrap().value, b"2");
    }

    #[test]
    fn size_tracks_appended_bytes() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(dir.path(), 1).unwrap();
        assert_eq!(wal.size(), 0);
        wal.append(&Action::new_put(b"k".to_vec(), b"v".to_vec(), 1)).unwrap();
        assert!(wal.size() > 0);
    }

    #[test]
    fn truncated_trailing_record_is_fatal() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(dir.path(), 1).unwrap();
        wal.append(&Action::new_put(b"k".to_vec(), b"v".to_vec(), 1)).unwrap();
        let path = wal.path().to_path_buf();
        wal.close().unwrap();

        // Truncate the file mid-record.
        let full_len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full_len - 2).unwrap();

        let err = Wal::replay(&path).unwrap_err();
        assert!(matches!(err, WalError::Truncated { .. }));
    }

    #[test]
    fn discover_sorts_newest_first() {
        let dir = tempdir().unwrap();
        Wal::create(dir.path(), 100).unwrap();
        Wal::create(dir.path(), 300).unwrap();
        Wal::create(dir.path(), 200).unwrap();

        let found = discover(dir.path()).unwrap();
        let tss: Vec<u64> = found.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(tss, vec![300, 200, 100]);
    }

    #[test]
    fn filename_round_trips_timestamp() {
        assert_eq!(parse_ts(&filename(12345)), Some(12345));
        assert_eq!(parse_ts("not_a_wal"), None);
    }
}
