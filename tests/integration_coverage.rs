//! Boundary-value and structural coverage that complements `integration.rs`:
//! exact size limits, multi-WAL-generation recovery, and the handling of
//! flushes that produce nothing to register.

use lsmkv::block::{MAX_KEY_LEN, MAX_VALUE_LEN};
use lsmkv::engine::{Engine, EngineConfig, EngineError};
use std::time::Duration;
use tempfile::TempDir;

fn small_flush_config() -> EngineConfig {
    EngineConfig {
        wal_flush_threshold: 4 * 1024,
        reader_pool_base_size: 2,
        compaction_interval: Duration::from_secs(3600),
        min_readers_for_compaction: 3,
    }
}

#[test]
fn key_at_exactly_max_len_round_trips_through_reopen() {
    let dir = TempDir::new().unwrap();
    let key = vec![b'k'; MAX_KEY_LEN];
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(&key, b"value").unwrap();
        engine.close().unwrap();
    }
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    assert_eq!(engine.get(&key).unwrap(), Some(b"value".to_vec()));
    engine.close().unwrap();
}

/// The key/value size limits are enforced on decode (WAL replay, SSTable
/// read), not on `put` itself — `put` only rejects an empty value. A key
/// one byte over the limit is therefore accepted by `put` and durably
/// written to the WAL, but makes the WAL unreplayable: the next `open`
/// fails decoding that action rather than silently truncating the key.
#[test]
fn oversized_key_is_accepted_by_put_but_rejected_on_replay() {
    let dir = TempDir::new().unwrap();
    let oversized_key = vec![b'x'; MAX_KEY_LEN + 1];
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(&oversized_key, b"value").unwrap();
        engine.close().unwrap();
    }
    let err = Engine::open(dir.path(), EngineConfig::default()).unwrap_err();
    assert!(matches!(err, EngineError::SizeExceeded(_)));
}

#[test]
fn large_value_near_the_limit_persists_across_flush_and_reopen() {
    let dir = TempDir::new().unwrap();
    // Well above typical sizes but short of the 20 MiB ceiling, to keep the
    // test's memory and I/O footprint modest while still exercising a
    // multi-block value path.
    let value = vec![b'v'; 1024 * 1024];
    {
        let engine = Engine::open(dir.path(), small_flush_config()).unwrap();
        engine.put(b"big", &value).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    assert_eq!(engine.get(b"big").unwrap(), Some(value));
    engine.close().unwrap();
}

#[test]
fn value_length_constant_matches_twenty_mebibytes() {
    assert_eq!(MAX_VALUE_LEN, 20 * 1024 * 1024);
}

/// Reopening without a clean `close` (simulating a crash) replays the WAL
/// generation left behind and recovers every write made before the crash.
#[test]
fn reopen_with_multiple_wal_generations_recovers_all_writes() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.put(b"gen1", b"a").unwrap();
    drop(engine);
    std::fs::write(dir.path().join("LOCK"), "999999999").unwrap();

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.put(b"gen2", b"b").unwrap();
    drop(engine);
    std::fs::write(dir.path().join("LOCK"), "999999999").unwrap();

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.put(b"gen3", b"c").unwrap();

    assert_eq!(engine.get(b"gen1").unwrap(), Some(b"a".to_vec()));
    assert_eq!(engine.get(b"gen2").unwrap(), Some(b"b".to_vec()));
    assert_eq!(engine.get(b"gen3").unwrap(), Some(b"c".to_vec()));
    engine.close().unwrap();
}

/// An explicit flush of an untouched memtable has nothing to write: no
/// SSTable file should appear on disk, and the directory should reopen
/// cleanly with no keys to find.
#[test]
fn flushing_an_empty_memtable_registers_no_sstable() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.flush().unwrap();
    engine.close().unwrap();

    let sst_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_str().is_some_and(|n| n.starts_with("sst_")))
        .collect();
    assert!(sst_files.is_empty(), "expected no SSTable files, found {sst_files:?}");
}

#[test]
fn keys_sorting_before_and_after_each_other_do_not_interfere() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.put(b"a", b"first").unwrap();
    engine.put(b"zzzz", b"last").unwrap();
    engine.put(b"m", b"middle").unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"first".to_vec()));
    assert_eq!(engine.get(b"m").unwrap(), Some(b"middle".to_vec()));
    assert_eq!(engine.get(b"zzzz").unwrap(), Some(b"last".to_vec()));
    engine.close().unwrap();
}
