//! # lsmkv
//!
//! An embedded, single-directory key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)**.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │  ┌─────────────┐   flush    ┌──────────────┐                │
//! │  │ WAL + main   │ ─────────▶│  switching    │                │
//! │  │  memtable    │           │  memtable     │                │
//! │  └──────┬───────┘           └──────┬────────┘                │
//! │         │ put/delete/get           │ serialize                │
//! │         ▼                          ▼                          │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │     SSTable readers (newest → oldest, COW list)       │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! │                          ▲                                    │
//! │                          │ compaction (periodic, N-way merge) │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Orchestrator — open, put, delete, get, flush, compact, close |
//! | [`memtable`] | In-memory ordered write buffer plus the switching holder |
//! | [`wal`] | Append-only write-ahead log, replayed into a memtable on open |
//! | [`sstable`] | Immutable on-disk sorted runs with bloom filters and index arrays |
//! | [`compaction`] | Multi-way merge of several SSTables into one |
//! | [`block`] | On-disk wire formats shared by the WAL and SSTable layers |
//! | [`bloom`] | Murmur3-backed bloom filter |
//! | [`encoding`] | Primitive big-endian `Encode`/`Decode` traits |
//!
//! ## Key properties
//!
//! - **Write-ahead logging** — every put/delete is durably appended and
//!   `fsync`'d before the call returns.
//! - **Crash recovery** — any WAL generation found at open time is replayed;
//!   stale generations are promoted to level-0 SSTables.
//! - **Checksummed, magic-tagged on-disk blocks** — WAL actions and SSTable
//!   blocks are corruption-detected, not just length-framed.
//! - **Bloom-filtered SSTable reads** — a filter miss skips the binary search
//!   and the disk entirely.
//! - **Non-blocking flush and compaction** — writers never wait on either;
//!   reads are served from a copy-on-write snapshot of the reader list.
//!
//! ## Non-goals
//!
//! Range scans, secondary indexes, and cross-directory transactions are out
//! of scope; see the design notes in `DESIGN.md` for the full rationale.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lsmkv::engine::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/my_store", EngineConfig::default()).unwrap();
//!
//! engine.put(b"hello", b"world").unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! engine.delete(b"hello").unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), None);
//!
//! engine.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod block;
pub mod bloom;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod memtable;
pub mod sstable;
pub mod wal;
