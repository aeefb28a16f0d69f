//! A bounded pool of independently-seekable read handles onto one SSTable
//! file.
//!
//! Every table open acquires `N` file descriptors up front and hands them
//! out through a bounded channel; a caller that needs to perform several
//! seek-then-read steps against the same position (a binary-search probe
//! sequence, say) borrows one handle for the whole sequence rather than
//! round-tripping the pool per read.

use std::fs::File;
use std::io;
use std::path::Path;

use crossbeam::channel::{Receiver, Sender, bounded};

pub struct ReaderPool {
    tx: Sender<File>,
    rx: Receiver<File>,
    size: usize,
}

impl ReaderPool {
    /// Open `size` independent read handles onto `path`.
    pub fn open(path: &Path, size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (tx, rx) = bounded(size);
        for _ in 0..size {
            let file = File::open(path)?;
            // Channel was just created with capacity `size`; sending `size`
            // items cannot block or fail.
            tx.try_send(file)
                .map_err(|_| io::Error::other("reader pool channel unexpectedly full"))?;
        }
        Ok(Self { tx, rx, size })
    }

    /// Borrow one handle for the duration of `f`, then return it to the
    /// pool. Blocks if every handle is currently on loan.
    pub fn with_handle<T>(&self, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut handle = self
            .rx
            .recv()
            .map_err(|_| io::Error::other("reader pool closed"))?;
        let result = f(&mut handle);
        // Pool was sized to exactly match the number of handles in flight;
        // sending it back cannot fail unless the pool itself was dropped,
        // which can't happen while `self` is still borrowed here.
        let _ = self.tx.send(handle);
        result
    }

    /// Drain and drop every handle, blocking until all outstanding loans
    /// have been returned.
    pub fn close(self) {
        drop(self.tx);
        for _ in 0..self.size {
            if self.rx.recv().is_err() {
                break;
            }
        }
    }
}
