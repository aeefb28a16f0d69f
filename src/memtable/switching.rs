//! Two-slot memtable holder enabling a new main to accept writes while the
//! old one is being flushed to an SSTable.

use super::{Memtable, Record};
use std::sync::{Arc, RwLock};

struct Slots {
    main: Arc<Memtable>,
    switching: Option<Arc<Memtable>>,
}

/// Holds a writable `main` memtable and an optional `switching` memtable
/// (the prior main, while its flush is in progress).
///
/// Both slots are published together under one lock, so a concurrent reader
/// either observes `(new main, old main)` or `(old main, None)` — both are
/// correct states to read from, never a torn mix of the two.
pub struct SwitchingMemtable {
    slots: RwLock<Slots>,
}

impl SwitchingMemtable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                main: Arc::new(Memtable::new()),
                switching: None,
            }),
        }
    }

    pub fn put(&self, key: Vec<u8>, record: Record) {
        let slots = self.slots.read().expect("switching memtable lock poisoned");
        slots.main.put(key, record);
    }

    /// Look up `key`, consulting `main` then `switching`.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        let slots = self.slots.read().expect("switching memtable lock poisoned");
        if let Some(record) = slots.main.get(key) {
            return Some(record);
        }
        slots.switching.as_ref().and_then(|s| s.get(key))
    }

    /// Atomically move `main` into the `switching` slot and install a fresh
    /// empty map as the new `main`. Returns the old main so the caller can
    /// serialize it to an SSTable.
    pub fn switch_new(&self) -> Arc<Memtable> {
        let mut slots = self.slots.write().expect("switching memtable lock poisoned");
        let old_main = slots.main.clone();
        slots.switching = Some(old_main.clone());
        slots.main = Arc::new(Memtable::new());
        old_main
    }

    /// Clear the `switching` slot after its flush has committed.
    pub fn clean_switch(&self) {
        let mut slots = self.slots.write().expect("switching memtable lock poisoned");
        slots.switching = None;
    }

    /// On flush failure: pour `main`'s entries into `switching`, then
    /// install `switching` as the new `main`, and clear `switching`.
    ///
    /// This preserves writes that arrived while the flush that failed was
    /// running — they live in `main` (the post-switch writable slot) and
    /// must survive the rollback.
    pub fn merge_to_main(&self) {
        let mut slots = self.slots.write().expect("switching memtable lock poisoned");
        let Some(switching) = slots.switching.take() else {
            return;
        };
        switching.absorb(&slots.main);
        slots.main = switching;
    }

    pub fn main_len(&self) -> usize {
        self.slots.read().expect("switching memtable lock poisoned").main.len()
    }
}

impl Default for SwitchingMemtable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_falls_through_to_switching_slot() {
        let sw = SwitchingMemtable::new();
        sw.put(b"k".to_vec(), Record::put(b"v1".to_vec(), 1));
        let _old = sw.switch_new();
        assert_eq!(sw.get(b"k").unwrap().value, b"v1");
        sw.put(b"k".to_vec(), Record::put(b"v2".to_vec(), 2));
        assert_eq!(sw.get(b"k").unwrap().value, b"v2");
    }

    #[test]
    fn clean_switch_drops_old_generation() {
        let sw = SwitchingMemtable::new();
        sw.put(b"k".to_vec(), Record::put(b"v1".to_vec(), 1));
        let _old = sw.switch_new();
        sw.clean_switch();
        assert_eq!(sw.get(b"k"), None);
    }

    #[test]
    fn merge_to_main_restores_concurrent_writes_after_flush_failure() {
        let sw = SwitchingMemtable::new();
        sw.put(b"k".to_vec(), Record::put(b"before-switch".to_vec(), 1));
        let _old = sw.switch_new();
        // A write lands on the new main while the flush of the old main is
        // (hypothetically) failing in the background.
        sw.put(b"k2".to_vec(), Record::put(b"during-flush".to_vec(), 2));

        sw.merge_to_main();

        assert_eq!(sw.get(b"k").unwrap().value, b"before-switch");
        assert_eq!(sw.get(b"k2").unwrap().value, b"during-flush");
    }

    #[test]
    fn merge_to_main_prefers_newer_timestamp_on_conflict() {
        let sw = SwitchingMemtable::new();
        sw.put(b"k".to_vec(), Record::put(b"old".to_vec(), 1));
        let _old = sw.switch_new();
        sw.put(b"k".to_vec(), Record::put(b"new".to_vec(), 2));

        sw.merge_to_main();

        assert_eq!(sw.get(b"k").unwrap().value, b"new");
    }
}
