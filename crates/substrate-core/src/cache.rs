//! # Substrate Cache
//!
//! Process-local membership mirror of the durable hashes.
//!
//! - `claim` is the only dedup decision in the pipeline: the first caller
//!   to claim a hash owns emitting its row
//! - Locking is per shard of the hash space (`dashmap`), so unrelated
//!   hashes never contend
//! - The store is the source of truth; dropping the cache and preloading it
//!   again never changes stored state
//!
//! The text memo maps literal word strings to composition handles so a
//! word seen earlier is not recomputed. It holds at most `text_capacity`
//! entries and is cleared whole when full.

use crate::compute::CompositionHandle;
use crate::primitives::DEFAULT_TEXT_MEMO;
use crate::storage::RedbSubstrate;
use crate::types::{ContentHash, SubstrateError};
use dashmap::{DashMap, DashSet};

/// Dedup cache shared by all pipeline stages.
#[derive(Debug)]
pub struct SubstrateCache {
    hashes: DashSet<ContentHash>,
    texts: DashMap<String, CompositionHandle>,
    text_capacity: usize,
}

impl Default for SubstrateCache {
    fn default() -> Self {
        Self {
            hashes: DashSet::new(),
            texts: DashMap::new(),
            text_capacity: DEFAULT_TEXT_MEMO,
        }
    }
}

impl SubstrateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the text memo to `capacity` entries; 0 disables it.
    #[must_use]
    pub fn with_text_capacity(mut self, capacity: usize) -> Self {
        self.text_capacity = capacity;
        self.texts.clear();
        self
    }

    /// Cache holding every atom, physicality, composition and relation hash
    /// in `store`.
    pub fn preload(store: &RedbSubstrate) -> Result<Self, SubstrateError> {
        let cache = Self::new();
        let loaded = store.for_each_hash(|hash| {
            cache.hashes.insert(hash);
        })?;
        tracing::debug!(hashes = loaded, "cache preloaded");
        Ok(cache)
    }

    #[must_use]
    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.hashes.contains(hash)
    }

    /// Idempotent insert.
    pub fn add(&self, hash: ContentHash) {
        self.hashes.insert(hash);
    }

    /// Atomic check-and-insert. `true` if the caller is the first to see
    /// `hash` and must emit its row.
    pub fn claim(&self, hash: ContentHash) -> bool {
        self.hashes.insert(hash)
    }

    /// Forget hashes whose rows never became durable.
    pub fn evict<'a>(&self, hashes: impl IntoIterator<Item = &'a ContentHash>) {
        for hash in hashes {
            self.hashes.remove(hash);
        }
    }

    #[must_use]
    pub fn text_handle(&self, text: &str) -> Option<CompositionHandle> {
        self.texts.get(text).map(|entry| *entry.value())
    }

    pub fn remember_text(&self, text: &str, handle: CompositionHandle) {
        if self.text_capacity == 0 {
            return;
        }
        if self.texts.len() >= self.text_capacity {
            self.texts.clear();
        }
        self.texts.insert(text.to_owned(), handle);
    }

    /// Entries currently in the text memo.
    #[must_use]
    pub fn text_len(&self) -> usize {
        self.texts.len()
    }

    pub fn clear_texts(&self) {
        self.texts.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point4;
    use crate::hashing::atom_hash;
    use std::sync::Arc;

    #[test]
    fn claim_is_first_wins() {
        let cache = SubstrateCache::new();
        let h = atom_hash(0x41);
        assert!(!cache.exists(&h));
        assert!(cache.claim(h));
        assert!(!cache.claim(h));
        assert!(cache.exists(&h));
        cache.add(h);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let cache = Arc::new(SubstrateCache::new());
        let h = atom_hash(7);
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    s.spawn(move || usize::from(cache.claim(h)))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn evict_allows_reclaim() {
        let cache = SubstrateCache::new();
        let h = atom_hash(1);
        assert!(cache.claim(h));
        cache.evict([&h]);
        assert!(cache.claim(h));
    }

    #[test]
    fn text_memo() {
        let cache = SubstrateCache::new();
        let handle = CompositionHandle {
            hash: atom_hash(2),
            centroid: Point4::new(1.0, 0.0, 0.0, 0.0),
            level: 1,
        };
        assert!(cache.text_handle("cat").is_none());
        cache.remember_text("cat", handle);
        assert_eq!(cache.text_handle("cat"), Some(handle));
        cache.clear_texts();
        assert!(cache.text_handle("cat").is_none());
    }

    #[test]
    fn text_memo_is_bounded() {
        let cache = SubstrateCache::new().with_text_capacity(3);
        let handle = CompositionHandle {
            hash: atom_hash(3),
            centroid: Point4::new(0.0, 1.0, 0.0, 0.0),
            level: 1,
        };
        for i in 0..10 {
            cache.remember_text(&format!("w{i}"), handle);
            assert!(cache.text_len() <= 3);
        }
        assert_eq!(cache.text_handle("w9"), Some(handle));

        let off = SubstrateCache::new().with_text_capacity(0);
        off.remember_text("cat", handle);
        assert_eq!(off.text_len(), 0);
    }
}
