//! # LSM storage engine
//!
//! The orchestrator tying every other module together: the exclusive
//! directory lock, the current WAL/memtable pair, the copy-on-write list of
//! SSTable readers, and the background flush/compaction machinery.
//!
//! ## Write path
//!
//! `put`/`delete` serialize on [`Shared::write_mutex`] (the "engine mutex" of
//! the design doc): a write assigns a timestamp, appends the action to the
//! current WAL, then installs the record into the writable memtable. Once the
//! WAL's tracked byte size crosses [`EngineConfig::wal_flush_threshold`], a
//! flush is scheduled on a background thread and `put`/`delete` return without
//! waiting for it.
//!
//! ## Read path
//!
//! `get` checks the switching memtable first (`main` then `switching`), then
//! walks a snapshot of the SSTable reader list newest-first. A reader whose
//! file handle pool reports an I/O failure (most plausibly because it is
//! mid-swap during a compaction) is skipped for that attempt; the whole walk
//! retries up to three times before giving up. A `CorruptBlock` or
//! `InternalNoProgress` failure from any reader is fatal and surfaces
//! immediately — see [`EngineError`].
//!
//! ## Flush and compaction
//!
//! Both are asynchronous and single-flight, guarded by an atomic flag rather
//! than a held lock (so the flag can be released from whichever thread
//! finishes the background work). A periodic ticker thread calls `compact`
//! at [`EngineConfig::compaction_interval`]; `Engine::compact` is also public
//! so a caller can trigger it eagerly.

mod lock;

use crate::block::Action;
use crate::bloom;
use crate::compaction::{self, CompactionError};
use crate::memtable::{Memtable, Record, SwitchingMemtable};
use crate::sstable::{self, SSTable, SSTableError, SstWriter};
use crate::wal::{self, Wal, WalError};
use lock::{DirLock, LockError};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;


/// Errors surfaced by the public engine API.
///
/// This is the single error type callers of [`Engine`] see; lower-layer
/// errors ([`WalError`], [`SSTableError`], [`CompactionError`]) are folded
/// into the variants below rather than wrapped transparently, matching the
/// taxonomy of corruption / I/O / size / lock / argument failures a caller
/// actually needs to branch on.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Magic mismatch, wrong block type, or checksum failure in a WAL action
    /// or SSTable block.
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A key or value exceeded its wire-format size limit on read.
    #[error("size exceeded: {0}")]
    SizeExceeded(String),

    /// The directory is already locked by another live engine instance.
    #[error("directory is already opened by another engine instance")]
    AlreadyOpen,

    /// `put` was called with an empty value; tombstones are produced only by
    /// `delete`.
    #[error("put requires a non-empty value; use delete for tombstones")]
    NilValue,

    /// A reader's binary search over its data-index failed to make progress,
    /// indicating a corrupted index array.
    #[error("internal error: index search made no progress")]
    InternalNoProgress,
}

impl From<WalError> for EngineError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(e) => EngineError::Io(e),
            WalError::Block(crate::block::BlockError::CorruptBlock(m)) => {
                EngineError::CorruptBlock(m)
            }
            WalError::Block(crate::block::BlockError::SizeExceeded(m)) => {
                EngineError::SizeExceeded(m)
            }
            WalError::Block(crate::block::BlockError::Encoding(e)) => {
                EngineError::Io(std::io::Error::other(e.to_string()))
            }
            WalError::Truncated { offset } => {
                EngineError::CorruptBlock(format!("WAL truncated mid-record at offset {offset}"))
            }
            WalError::InvalidFilename(name) => {
                EngineError::Io(std::io::Error::other(format!("invalid WAL filename: {name}")))
            }
        }
    }
}

impl From<SSTableError> for EngineError {
    fn from(e: SSTableError) -> Self {
        match e {
            SSTableError::Io(e) => EngineError::Io(e),
            SSTableError::Corrupt(m) => EngineError::CorruptBlock(m),
            SSTableError::Block(crate::block::BlockError::CorruptBlock(m)) => {
                EngineError::CorruptBlock(m)
            }
            SSTableError::Block(crate::block::BlockError::SizeExceeded(m)) => {
                EngineError::SizeExceeded(m)
            }
            SSTableError::Block(crate::block::BlockError::Encoding(e)) => {
                EngineError::Io(std::io::Error::other(e.to_string()))
            }
            SSTableError::NoProgress => EngineError::InternalNoProgress,
            SSTableError::InvalidFilename(name) => EngineError::Io(std::io::Error::other(
                format!("invalid SSTable filename: {name}"),
            )),
        }
    }
}

impl From<CompactionError> for EngineError {
    fn from(e: CompactionError) -> Self {
        match e {
            CompactionError::SSTable(e) => e.into(),
        }
    }
}

impl From<LockError> for EngineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyLocked(_) => EngineError::AlreadyOpen,
            LockError::Io(e) => EngineError::Io(e),
        }
    }
}

/// Tunables for an [`Engine`] instance.
///
/// The design doc leaves these as "e.g." values; this struct is how a caller
/// overrides them. There is no file-based configuration layer — constructing
/// `EngineConfig` programmatically is the whole of "configuration" here,
/// matching the spec's exclusion of a config-parsing collaborator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WAL byte size above which a flush is scheduled after a write.
    pub wal_flush_threshold: u64,
    /// Base number of pooled read handles for a level-0 SSTable; grows with
    /// level (see [`reader_pool_size`]).
    pub reader_pool_base_size: usize,
    /// How often the background ticker attempts a compaction.
    pub compaction_interval: Duration,
    /// Minimum number of SSTable readers before compaction considers running.
    pub min_readers_for_compaction: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_flush_threshold: 2 * 1024 * 1024,
            reader_pool_base_size: 3,
            compaction_interval: Duration::from_secs(5),
            min_readers_for_compaction: 3,
        }
    }
}

/// Reader-pool size for a given SSTable level: grows modestly with level,
/// capped at 10 so high levels don't accumulate unbounded file descriptors.
fn reader_pool_size(config: &EngineConfig, level: u32) -> usize {
    (config.reader_pool_base_size + level as usize * 2).min(10)
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

struct Shared {
    dir: PathBuf,
    lock: Mutex<Option<DirLock>>,
    wal: RwLock<Wal>,
    /// Timestamp of the current WAL generation.
    ts: AtomicU64,
    /// Monotonic clock for timestamp assignment: guarantees strictly
    /// increasing `ts` even across calls landing in the same nanosecond.
    last_ts: AtomicU64,
    mem: SwitchingMemtable,
    /// Copy-on-write list of SSTable readers, newest first.
    readers: RwLock<Arc<Vec<Arc<SSTable>>>>,
    write_mutex: Mutex<()>,
    flush_in_progress: AtomicBool,
    compaction_in_progress: AtomicBool,
    ticker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    closed: AtomicBool,
    config: EngineConfig,
}

/// Handle to an open LSM storage engine.
///
/// Cheaply `Clone`able — every clone shares the same underlying state via an
/// internal `Arc`, so it can be handed to multiple threads (wrap in
/// `Arc<Engine>` too if that's more convenient; both work identically).
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Shared>,
}

impl Engine {
    /// Opens (or creates) an engine rooted at `dir`.
    ///
    /// Acquires an exclusive lock on the directory for the lifetime of the
    /// returned handle. Any WAL generation other than the newest is replayed
    /// and promoted to a level-0 SSTable before the active memtable is
    /// populated from the newest WAL.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;

        let wal_files = wal::discover(&dir)?;
        let mem = SwitchingMemtable::new();

        // Promote every WAL generation except the newest.
        for (ts, path) in wal_files.iter().skip(1) {
            let size = fs::metadata(path)?.len();
            if size == 0 {
                fs::remove_file(path)?;
                continue;
            }
            let replayed = Wal::replay(path)?;
            write_memtable_to_sstable(&dir, *ts, &replayed)?;
            fs::remove_file(path)?;
            tracing::info!(ts, "promoted stale WAL generation to SSTable at open");
        }

        // Active WAL generation: reuse the newest on disk, or start fresh.
        let (active_ts, wal) = match wal_files.first() {
            Some((ts, path)) => {
                let replayed = Wal::replay(path)?;
                replayed.foreach(|key, record| mem.put(key.to_vec(), record.clone()));
                (*ts, Wal::open_existing(path.clone(), *ts)?)
            }
            None => {
                let ts = now_ns();
                (ts, Wal::create(&dir, ts)?)
            }
        };

        // Discover SSTables, newest-first by ts.
        let mut sst_files: Vec<(u32, u64, PathBuf)> = sstable::discover(&dir)?
            .into_iter()
            .map(|path| {
                let (level, ts) = sstable::parse_filename(&path)?;
                Ok((level, ts, path))
            })
            .collect::<Result<_, SSTableError>>()?;
        sst_files.sort_by(|a, b| b.1.cmp(&a.1));

        let mut readers = Vec::with_capacity(sst_files.len());
        for (level, _ts, path) in sst_files {
            if let Some(sst) = SSTable::open(path, reader_pool_size(&config, level))? {
                readers.push(Arc::new(sst));
            }
        }

        let shared = Shared {
            dir,
            lock: Mutex::new(Some(lock)),
            wal: RwLock::new(wal),
            ts: AtomicU64::new(active_ts),
            last_ts: AtomicU64::new(active_ts),
            mem,
            readers: RwLock::new(Arc::new(readers)),
            write_mutex: Mutex::new(()),
            flush_in_progress: AtomicBool::new(false),
            compaction_in_progress: AtomicBool::new(false),
            ticker: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        };

        let engine = Engine {
            inner: Arc::new(shared),
        };
        engine.start_ticker();
        tracing::info!(path = %engine.inner.dir.display(), "engine opened");
        Ok(engine)
    }

    /// Insert `key -> value`.
    ///
    /// `value` must be non-empty; an empty value is reserved for the
    /// tombstone encoding produced internally by [`Engine::delete`].
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        if value.is_empty() {
            return Err(EngineError::NilValue);
        }

        let guard = self
            .inner
            .write_mutex
            .lock()
            .expect("engine write mutex poisoned");
        let ts = self.next_ts();
        let action = Action::new_put(key.to_vec(), value.to_vec(), ts);
        self.inner
            .wal
            .read()
            .expect("WAL lock poisoned")
            .append(&action)?;
        self.inner
            .mem
            .put(key.to_vec(), Record::put(value.to_vec(), ts));
        let wal_size = self.inner.wal.read().expect("WAL lock poisoned").size();
        drop(guard);

        if wal_size > self.inner.config.wal_flush_threshold {
            self.trigger_flush();
        }
        Ok(())
    }

    /// Delete `key` (insert a tombstone).
    pub fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        let guard = self
            .inner
            .write_mutex
            .lock()
            .expect("engine write mutex poisoned");
        let ts = self.next_ts();
        let action = Action::new_delete(key.to_vec(), ts);
        self.inner
            .wal
            .read()
            .expect("WAL lock poisoned")
            .append(&action)?;
        self.inner.mem.put(key.to_vec(), Record::tombstone(ts));
        let wal_size = self.inner.wal.read().expect("WAL lock poisoned").size();
        drop(guard);

        if wal_size > self.inner.config.wal_flush_threshold {
            self.trigger_flush();
        }
        Ok(())
    }

    /// Look up `key`.
    ///
    /// Returns `None` if the key was never written, or if the newest record
    /// visible for it is a tombstone. Consults the switching memtable first,
    /// then SSTable readers newest-to-oldest.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        if let Some(record) = self.inner.mem.get(key) {
            return Ok(if record.deleted { None } else { Some(record.value) });
        }

        let readers = self.inner.readers.read().expect("readers lock poisoned").clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut saw_open_failure = false;
            for sst in readers.iter() {
                match sst.get_by_key(key) {
                    Ok(Some(record)) => {
                        return Ok(if record.deleted { None } else { Some(record.value) });
                    }
                    Ok(None) => {}
                    // Treat as the pooled file-handle failure the design doc
                    // calls out (pool exhausted, or the file mid-swap during
                    // compaction): skip this reader and keep walking the rest
                    // of the list within the same attempt.
                    Err(SSTableError::Io(e)) => {
                        tracing::warn!(error = %e, "reader open failure, will retry list");
                        saw_open_failure = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !saw_open_failure || attempt >= 3 {
                return Ok(None);
            }
        }
    }

    /// Schedule a flush of the current memtable and return immediately.
    ///
    /// A no-op if a flush is already in flight.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.trigger_flush();
        Ok(())
    }

    /// Schedule a compaction round and return immediately.
    ///
    /// A no-op if compaction is already in flight or there are too few
    /// readers to be worth compacting.
    pub fn compact(&self) -> Result<(), EngineError> {
        self.trigger_compaction();
        Ok(())
    }

    /// Gracefully shut down the engine: excludes any in-flight flush, stops
    /// the compaction ticker, closes (without deleting) the current WAL so
    /// it replays on next open, releases the directory lock, and closes
    /// every SSTable reader's pool — blocking until in-flight reads on it
    /// finish.
    ///
    /// Idempotent: a second call is a no-op.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        while self
            .inner
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            thread::sleep(Duration::from_millis(5));
        }

        if let Some((tx, handle)) = self
            .inner
            .ticker
            .lock()
            .expect("ticker lock poisoned")
            .take()
        {
            drop(tx);
            let _ = handle.join();
        }

        self.inner.wal.read().expect("WAL lock poisoned").close()?;

        if let Some(lock) = self
            .inner
            .lock
            .lock()
            .expect("directory lock mutex poisoned")
            .take()
            && let Err(e) = lock.release()
        {
            tracing::warn!(error = %e, "failed to release directory lock at close");
        }

        let readers = {
            let mut guard = self.inner.readers.write().expect("readers lock poisoned");
            std::mem::replace(&mut *guard, Arc::new(Vec::new()))
        };
        for sst in readers.iter().cloned() {
            close_when_exclusive(sst);
        }

        self.inner.flush_in_progress.store(false, Ordering::Release);
        Ok(())
    }

    fn next_ts(&self) -> u64 {
        loop {
            let prev = self.inner.last_ts.load(Ordering::Acquire);
            let now = now_ns();
            let candidate = if now > prev { now } else { prev + 1 };
            if self
                .inner
                .last_ts
                .compare_exchange(prev, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    fn trigger_flush(&self) {
        if self
            .inner
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let engine = self.clone();
        thread::spawn(move || engine.run_flush());
    }

    /// Flush protocol: rotate WAL+memtable under the write mutex, serialize
    /// the old memtable in the background, then either register the new
    /// SSTable reader and drop the old WAL, or — on failure — merge the old
    /// memtable's entries back into `main` so no write is lost.
    fn run_flush(&self) {
        let new_ts = self.next_ts();
        let new_wal = match Wal::create(&self.inner.dir, new_ts) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "failed to create new WAL for flush");
                self.inner.flush_in_progress.store(false, Ordering::Release);
                return;
            }
        };

        let (old_wal, old_memtable) = {
            let guard = self
                .inner
                .write_mutex
                .lock()
                .expect("engine write mutex poisoned");
            let old_wal = {
                let mut w = self.inner.wal.write().expect("WAL lock poisoned");
                std::mem::replace(&mut *w, new_wal)
            };
            self.inner.ts.store(new_ts, Ordering::Release);
            let old_memtable = self.inner.mem.switch_new();
            drop(guard);
            (old_wal, old_memtable)
        };
        let old_ts = old_wal.ts();

        match write_memtable_to_sstable(&self.inner.dir, old_ts, &old_memtable) {
            Ok(Some(path)) => match SSTable::open(path, reader_pool_size(&self.inner.config, 0)) {
                Ok(Some(sst)) => {
                    self.prepend_reader(Arc::new(sst));
                    self.inner.mem.clean_switch();
                    if let Err(e) = old_wal.delete_file() {
                        tracing::warn!(error = %e, "failed to delete WAL after flush commit");
                    }
                    tracing::info!(ts = old_ts, "flush committed");
                }
                Ok(None) => {
                    // A non-empty writer that produced no file can't happen;
                    // treat defensively as "nothing to flush".
                    self.inner.mem.clean_switch();
                    let _ = old_wal.delete_file();
                }
                Err(e) => {
                    tracing::error!(error = %e, ts = old_ts, "failed to open freshly flushed SSTable");
                    self.inner.mem.merge_to_main();
                }
            },
            Ok(None) => {
                // Empty memtable: nothing to register, but the WAL still
                // needs to go since its (empty) contents are accounted for.
                self.inner.mem.clean_switch();
                if let Err(e) = old_wal.delete_file() {
                    tracing::warn!(error = %e, "failed to delete empty WAL after flush");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, ts = old_ts, "flush failed, restoring memtable");
                self.inner.mem.merge_to_main();
            }
        }

        self.inner.flush_in_progress.store(false, Ordering::Release);
    }

    fn prepend_reader(&self, sst: Arc<SSTable>) {
        let mut guard = self.inner.readers.write().expect("readers lock poisoned");
        let mut new_list = Vec::with_capacity(guard.len() + 1);
        new_list.push(sst);
        new_list.extend(guard.iter().cloned());
        *guard = Arc::new(new_list);
    }

    fn trigger_compaction(&self) {
        if self
            .inner
            .compaction_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let engine = self.clone();
        thread::spawn(move || {
            if let Err(e) = engine.run_compaction() {
                tracing::error!(error = %e, "compaction failed");
            }
            engine
                .inner
                .compaction_in_progress
                .store(false, Ordering::Release);
        });
    }

    /// Compaction protocol: pick the two-thirds lowest-level readers (at
    /// least two), merge them one level above the highest input, then
    /// atomically swap the merged reader in for the inputs. Input files are
    /// closed and deleted once no in-flight read still references them.
    fn run_compaction(&self) -> Result<(), EngineError> {
        let snapshot = self.inner.readers.read().expect("readers lock poisoned").clone();
        if snapshot.len() < self.inner.config.min_readers_for_compaction {
            return Ok(());
        }

        // The merged output is appended to the *tail* of the newest-first
        // list (oldest read position), so the inputs retired into it must
        // themselves be the oldest among the lowest-level tables: taking the
        // newest ones instead would demote them below older, un-merged
        // readers and break the newest-wins read order.
        let mut candidates: Vec<Arc<SSTable>> = snapshot.iter().cloned().collect();
        candidates.sort_by_key(|s| (s.level(), s.ts()));
        let take_n = ((2 * candidates.len()) / 3).max(2);
        let inputs: Vec<Arc<SSTable>> = candidates.into_iter().take(take_n).collect();

        let input_paths: Vec<PathBuf> = inputs.iter().map(|s| s.path().to_path_buf()).collect();
        let out_level = inputs.iter().map(|s| s.level()).max().unwrap_or(0) + 1;
        let out_ts = inputs.iter().map(|s| s.ts()).max().unwrap_or_else(|| self.next_ts());

        let merged_path = compaction::merge(&input_paths, &self.inner.dir, out_level, out_ts)?;
        let new_sst = match merged_path {
            Some(path) => SSTable::open(path, reader_pool_size(&self.inner.config, out_level))?
                .map(Arc::new),
            None => None,
        };

        let removed = {
            let mut guard = self.inner.readers.write().expect("readers lock poisoned");
            let mut kept = Vec::with_capacity(guard.len());
            let mut removed = Vec::with_capacity(input_paths.len());
            for sst in guard.iter() {
                if input_paths.contains(&sst.path().to_path_buf()) {
                    removed.push(sst.clone());
                } else {
                    kept.push(sst.clone());
                }
            }
            if let Some(sst) = new_sst {
                kept.push(sst);
            }
            *guard = Arc::new(kept);
            removed
        };

        tracing::info!(
            inputs = removed.len(),
            out_level,
            out_ts,
            "compaction committed"
        );
        for sst in removed {
            retire_reader(sst);
        }
        Ok(())
    }

    fn start_ticker(&self) {
        let (tx, rx) = channel::bounded::<()>(0);
        let engine = self.clone();
        let interval = self.inner.config.compaction_interval;
        let handle = thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => engine.trigger_compaction(),
            }
        });
        *self.inner.ticker.lock().expect("ticker lock poisoned") = Some((tx, handle));
    }
}

/// Serialize `memtable`'s current entries to a new level-0 SSTable file
/// named with `ts`. Returns `None` if the memtable was empty.
fn write_memtable_to_sstable(
    dir: &Path,
    ts: u64,
    memtable: &Memtable,
) -> Result<Option<PathBuf>, EngineError> {
    let mut writer = SstWriter::create(dir, 0, ts, bloom::bit_length_for_level(0))?;
    let mut first_err = None;
    memtable.foreach(|key, record| {
        if first_err.is_none()
            && let Err(e) = writer.add(key, record)
        {
            first_err = Some(e);
        }
    });
    if let Some(e) = first_err {
        return Err(e.into());
    }
    Ok(writer.finish()?)
}

/// Wait until `sst` is the sole owner of its `Arc`, then close its reader
/// pool (blocking until any outstanding borrow returns). Used both at
/// engine close (synchronously) and after compaction retires an input
/// (from a detached thread, so it doesn't block the compaction that found
/// it).
fn close_when_exclusive(mut sst: Arc<SSTable>) {
    loop {
        match Arc::try_unwrap(sst) {
            Ok(table) => {
                table.close();
                return;
            }
            Err(arc) => {
                sst = arc;
                thread::sleep(Duration::from_millis(2));
            }
        }
    }
}

fn retire_reader(sst: Arc<SSTable>) {
    thread::spawn(move || {
        let path = sst.path().to_path_buf();
        close_when_exclusive(sst);
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to delete retired SSTable file");
        }
    });
}
