//! In-memory ordered map buffering recent writes, plus the switching
//! memtable that lets a new main accept writes while the old one flushes.

mod switching;

pub use switching::SwitchingMemtable;

use std::collections::BTreeMap;
use std::sync::RwLock;

/// The logical value stored per key: either a live value or a tombstone,
/// tagged with the nanosecond timestamp it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub deleted: bool,
    pub ts: u64,
    pub value: Vec<u8>,
}

impl Record {
    pub fn put(value: Vec<u8>, ts: u64) -> Self {
        Self {
            deleted: false,
            ts,
            value,
        }
    }

    pub fn tombstone(ts: u64) -> Self {
        Self {
            deleted: true,
            ts,
            value: Vec::new(),
        }
    }
}

/// An ordered `key -> Record` map, sorted by key, holding at most one
/// current record per key.
#[derive(Debug, Default)]
pub struct Memtable {
    tree: RwLock<BTreeMap<Vec<u8>, Record>>,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    /// Overwrite (or insert) the record for `key`.
    pub fn put(&self, key: Vec<u8>, record: Record) {
        // Lock poisoning here would mean a prior writer panicked mid-mutation;
        // there is no safe recovery, so propagate the panic rather than
        // silently serving a possibly-inconsistent tree.
        self.tree.write().expect("memtable lock poisoned").insert(key, record);
    }

    /// Look up the current record for `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.tree
            .read()
            .expect("memtable lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn min_key(&self) -> Option<Vec<u8>> {
        self.tree
            .read()
            .expect("memtable lock poisoned")
            .keys()
            .next()
            .cloned()
    }

    pub fn max_key(&self) -> Option<Vec<u8>> {
        self.tree
            .read()
            .expect("memtable lock poisoned")
            .keys()
            .next_back()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tree.read().expect("memtable lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry in ascending key order.
    pub fn foreach(&self, mut callback: impl FnMut(&[u8], &Record)) {
        let tree = self.tree.read().expect("memtable lock poisoned");
        for (key, record) in tree.iter() {
            callback(key, record);
        }
    }

    /// Snapshot all entries into a sorted vector. Used by the SSTable writer
    /// when serializing a frozen memtable.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Record)> {
        self.tree
            .read()
            .expect("memtable lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Pour every entry of `other` into `self`, without overwriting a key
    /// that already has a newer record in `self`. Used by `merge_to_main`
    /// to recover writes that landed concurrently with a failed flush.
    fn absorb(&self, other: &Memtable) {
        let mut tree = self.tree.write().expect("memtable lock poisoned");
        let other_tree = other.tree.read().expect("memtable lock poisoned");
        for (key, record) in other_tree.iter() {
            match tree.get(key) {
                Some(existing) if existing.ts >= record.ts => {}
                _ => {
                    tree.insert(key.clone(), record.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_value() {
        let mem = Memtable::new();
        mem.put(b"k".to_vec(), Record::put(b"v".to_vec(), 1));
        assert_eq!(mem.get(b"k"), Some(Record::put(b"v".to_vec(), 1)));
    }

    #[test]
    fn put_overwrites_prior_record_for_same_key() {
        let mem = Memtable::new();
        mem.put(b"k".to_vec(), Record::put(b"v1".to_vec(), 1));
        mem.put(b"k".to_vec(), Record::put(b"v2".to_vec(), 2));
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.get(b"k").unwrap().value, b"v2");
    }

    #[test]
    fn tombstone_shadows_prior_value() {
        let mem = Memtable::new();
        mem.put(b"k".to_vec(), Record::put(b"v".to_vec(), 1));
        mem.put(b"k".to_vec(), Record::tombstone(2));
        assert!(mem.get(b"k").unwrap().deleted);
    }

    #[test]
    fn foreach_yields_ascending_key_order() {
        let mem = Memtable::new();
        for k in ["c", "a", "b"] {
            mem.put(k.as_bytes().to_vec(), Record::put(b"x".to_vec(), 1));
        }
        let mut seen = Vec::new();
        mem.foreach(|k, _| seen.push(k.to_vec()));
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn absorb_keeps_higher_timestamp() {
        let main = Memtable::new();
        main.put(b"k".to_vec(), Record::put(b"newer".to_vec(), 5));
        let switching = Memtable::new();
        switching.put(b"k".to_vec(), Record::put(b"older".to_vec(), 1));
        switching.put(b"j".to_vec(), Record::put(b"only-here".to_vec(), 3));

        main.absorb(&switching);
        assert_eq!(main.get(b"k").unwrap().value, b"newer");
        assert_eq!(main.get(b"j").unwrap().value, b"only-here");
    }
}
