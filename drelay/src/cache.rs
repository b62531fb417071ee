// Copyright 2024 Yann Prado
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! In-memory response cache with TTL semantics.

use crate::error::CacheError;
use hashbrown::HashMap;
use hickory_proto::rr::Record;
use std::{
    sync::RwLock,
    time::{Duration, SystemTime},
};

// Cached answers are kept for at least an hour regardless of the answer TTL;
// the forwarder fronts relatively stable records and trades freshness for
// fewer upstream round trips.
const MIN_TTL: u64 = 3600;

/// A cached answer set together with its absolute expiry time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Answer records as received from the upstream, in answer-section order.
    pub records: Vec<Record>,
    /// Absolute time after which the entry no longer counts as fresh.
    pub expires_at: SystemTime,
}

/// Map type consumed by [`MemoryCache::load`] and produced by
/// [`MemoryCache::get_all`].
pub type Snapshot = HashMap<String, CacheEntry>;

/// In-memory cache keyed by fully-qualified query name, trailing dot included.
///
/// Concurrent readers, exclusive writers. Expired entries stay in the map and
/// are merely reported as expired; they leave on [`MemoryCache::delete`],
/// [`MemoryCache::clear`] or [`MemoryCache::load`].
pub struct MemoryCache {
    map: RwLock<Snapshot>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Records stored under `name`, fresh or not.
    pub fn get(&self, name: &str) -> Result<Vec<Record>, CacheError> {
        self.map
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.records.clone())
            .ok_or(CacheError::NotFound)
    }

    /// Records stored under `name`, provided the entry has not expired.
    ///
    /// Existence check, expiry check and copy happen under one shared
    /// acquisition, so a concurrent `delete` cannot slip in between.
    pub fn fresh(&self, name: &str) -> Option<Vec<Record>> {
        let map = self.map.read().unwrap();
        map.get(name)
            .filter(|e| SystemTime::now() < e.expires_at)
            .map(|e| e.records.clone())
    }

    /// Store `records` under `name`.
    ///
    /// The entry expires after the first record's TTL, floored at an hour.
    /// An empty record list is ignored.
    pub fn set(&self, name: &str, records: &[Record]) {
        let first = match records.first() {
            Some(r) => r,
            None => return,
        };
        let ttl = u64::from(first.ttl()).max(MIN_TTL);
        let entry = CacheEntry {
            records: records.to_vec(),
            expires_at: SystemTime::now() + Duration::from_secs(ttl),
        };
        self.map.write().unwrap().insert(name.to_owned(), entry);
    }

    /// True when `name` is present, expired or not.
    pub fn exists(&self, name: &str) -> bool {
        self.map.read().unwrap().contains_key(name)
    }

    /// True when `name` is absent or its entry has expired.
    pub fn has_expired(&self, name: &str) -> bool {
        match self.map.read().unwrap().get(name) {
            Some(e) => SystemTime::now() >= e.expires_at,
            None => true,
        }
    }

    /// Absolute expiry time of `name`, if present.
    pub fn expire_at(&self, name: &str) -> Option<SystemTime> {
        self.map.read().unwrap().get(name).map(|e| e.expires_at)
    }

    /// Remove `name` from the cache.
    pub fn delete(&self, name: &str) -> Result<(), CacheError> {
        match self.map.write().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(CacheError::NotFound),
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.map.write().unwrap().clear();
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// True when the cache holds no entry.
    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    /// The current key set.
    pub fn keys(&self) -> Vec<String> {
        self.map.read().unwrap().keys().cloned().collect()
    }

    /// A full copy of the current contents.
    pub fn get_all(&self) -> Snapshot {
        self.map.read().unwrap().clone()
    }

    /// Replace the contents wholesale.
    pub fn load(&self, snapshot: Snapshot) {
        *self.map.write().unwrap() = snapshot;
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheEntry, MemoryCache, Snapshot};
    use crate::error::CacheError;
    use hickory_proto::rr::{rdata::A, Name, RData, Record};
    use std::time::{Duration, SystemTime};

    fn a(name: &str, ttl: u32, octets: [u8; 4]) -> Record {
        Record::from_rdata(
            Name::from_utf8(name).unwrap(),
            ttl,
            RData::A(A::new(octets[0], octets[1], octets[2], octets[3])),
        )
    }

    #[test]
    fn ttl_is_floored_at_an_hour() {
        let cache = MemoryCache::new();
        cache.set("low.test.", &[a("low.test.", 60, [10, 0, 0, 1])]);
        cache.set("zero.test.", &[a("zero.test.", 0, [10, 0, 0, 2])]);
        cache.set("high.test.", &[a("high.test.", 7200, [10, 0, 0, 3])]);

        for name in ["low.test.", "zero.test."] {
            let left = cache
                .expire_at(name)
                .unwrap()
                .duration_since(SystemTime::now())
                .unwrap();
            assert!(left > Duration::from_secs(3590) && left <= Duration::from_secs(3600));
        }
        let left = cache
            .expire_at("high.test.")
            .unwrap()
            .duration_since(SystemTime::now())
            .unwrap();
        assert!(left > Duration::from_secs(7190) && left <= Duration::from_secs(7200));
    }

    #[test]
    fn absent_keys() {
        let cache = MemoryCache::new();
        assert!(cache.has_expired("missing.test."));
        assert!(!cache.exists("missing.test."));
        assert_eq!(cache.expire_at("missing.test."), None);
        assert_eq!(cache.get("missing.test."), Err(CacheError::NotFound));
        assert_eq!(cache.delete("missing.test."), Err(CacheError::NotFound));
        // Clearing an empty cache is a no-op.
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn set_get_delete() {
        let cache = MemoryCache::new();
        let records = vec![a("x.test.", 60, [10, 1, 1, 1])];
        cache.set("x.test.", &records);

        assert!(cache.exists("x.test."));
        assert!(!cache.has_expired("x.test."));
        assert_eq!(cache.get("x.test.").unwrap(), records);
        assert_eq!(cache.fresh("x.test.").unwrap(), records);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.keys(), vec!["x.test.".to_owned()]);

        cache.delete("x.test.").unwrap();
        assert!(!cache.exists("x.test."));
    }

    #[test]
    fn empty_record_list_is_ignored() {
        let cache = MemoryCache::new();
        cache.set("empty.test.", &[]);
        assert!(!cache.exists("empty.test."));
    }

    #[test]
    fn expired_entries_are_visible_but_not_fresh() {
        let cache = MemoryCache::new();
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "old.test.".to_owned(),
            CacheEntry {
                records: vec![a("old.test.", 60, [10, 2, 2, 2])],
                expires_at: SystemTime::now() - Duration::from_secs(1),
            },
        );
        cache.load(snapshot);

        assert!(cache.exists("old.test."));
        assert!(cache.has_expired("old.test."));
        assert_eq!(cache.fresh("old.test."), None);
        // A plain get still serves the stale records.
        assert_eq!(cache.get("old.test.").unwrap().len(), 1);
    }

    #[test]
    fn load_replaces_contents() {
        let cache = MemoryCache::new();
        cache.set("gone.test.", &[a("gone.test.", 60, [10, 3, 3, 3])]);

        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "kept.test.".to_owned(),
            CacheEntry {
                records: vec![a("kept.test.", 60, [10, 4, 4, 4])],
                expires_at: SystemTime::now() + Duration::from_secs(60),
            },
        );
        cache.load(snapshot);

        assert!(!cache.exists("gone.test."));
        assert!(cache.exists("kept.test."));
        assert_eq!(cache.len(), 1);
    }
}
