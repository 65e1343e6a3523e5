//! In-memory storage backend.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::data::Data;
use crate::message::SnapshotEntry;
use crate::store::StorageBackend;

#[derive(Clone, Debug)]
struct Entry {
    value: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now < deadline,
            None => true,
        }
    }
}

/// A sorted map of live entries with per-key deadlines.
#[derive(Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Data, Entry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&mut self, key: Data, value: Data, expires_at: Option<Instant>) -> Option<Data> {
        let now = Instant::now();
        let old = self.entries.insert(key, Entry { value, expires_at });
        old.filter(|entry| entry.live(now)).map(|entry| entry.value)
    }

    fn get(&self, key: &Data, now: Instant) -> Option<Data> {
        self.entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone())
    }

    fn erase(&mut self, key: &Data) -> Option<Data> {
        let now = Instant::now();
        self.entries
            .remove(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value)
    }

    fn clear(&mut self) -> Vec<Data> {
        let keys = self.entries.keys().cloned().collect();
        self.entries.clear();
        keys
    }

    fn expire_due(&mut self, now: Instant) -> Vec<Data> {
        let due: Vec<Data> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.entries.remove(key);
        }
        due
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| entry.expires_at)
            .min()
    }

    fn snapshot(&self, now: Instant) -> Vec<SnapshotEntry> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.live(now))
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
                expiry: entry
                    .expires_at
                    .map(|deadline| deadline.saturating_duration_since(now)),
            })
            .collect()
    }

    fn replace_all(&mut self, entries: Vec<SnapshotEntry>, now: Instant) {
        self.entries.clear();
        for entry in entries {
            self.entries.insert(
                entry.key,
                Entry {
                    value: entry.value,
                    expires_at: entry.expiry.map(|remaining| now + remaining),
                },
            );
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn put_returns_previous_value() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.put(Data::from("k"), Data::from(1), None), None);
        assert_eq!(
            backend.put(Data::from("k"), Data::from(2), None),
            Some(Data::from(1))
        );
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let mut backend = MemoryBackend::new();
        let now = Instant::now();
        backend.put(Data::from("k"), Data::from(1), Some(now));
        assert_eq!(backend.get(&Data::from("k"), now), None);
        assert_eq!(backend.expire_due(now), vec![Data::from("k")]);
        assert_eq!(backend.len(), 0);
    }

    #[test]
    fn next_expiry_is_the_earliest_deadline() {
        let mut backend = MemoryBackend::new();
        let now = Instant::now();
        let near = now + Duration::from_secs(1);
        let far = now + Duration::from_secs(10);
        backend.put(Data::from("far"), Data::from(1), Some(far));
        backend.put(Data::from("near"), Data::from(2), Some(near));
        backend.put(Data::from("never"), Data::from(3), None);
        assert_eq!(backend.next_expiry(), Some(near));
    }

    #[test]
    fn snapshot_roundtrips_through_replace_all() {
        let mut backend = MemoryBackend::new();
        let now = Instant::now();
        backend.put(Data::from("a"), Data::from(1), None);
        backend.put(Data::from("b"), Data::from(2), Some(now + Duration::from_secs(5)));

        let snapshot = backend.snapshot(now);
        let mut restored = MemoryBackend::new();
        restored.replace_all(snapshot, now);

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(&Data::from("a"), now), Some(Data::from(1)));
        assert_eq!(restored.get(&Data::from("b"), now), Some(Data::from(2)));
        assert!(restored.next_expiry().is_some());
    }
}
