use std::collections::{HashMap, VecDeque};

use zeroize::Zeroize;

/// `keystore_cache_size` semantics (§4.1 / §6): `-1` disables the cache entirely (every
/// lookup hits the filesystem), `0` means unbounded, and any positive value caps the
/// number of resident entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Disabled,
    Unbounded,
    Bounded(usize),
}

impl CacheMode {
    pub fn from_config(cache_size: i64) -> Self {
        match cache_size {
            n if n < 0 => CacheMode::Disabled,
            0 => CacheMode::Unbounded,
            n => CacheMode::Bounded(n as usize),
        }
    }
}

/// Bounded LRU cache of decrypted key material. Intrusive doubly-linked-list-and-map
/// designs are the conventional shape for this; a `VecDeque` recency queue alongside the
/// map gets the same eviction-order behavior without unsafe linked-list plumbing.
///
/// Evicted (and dropped) buffers are zeroed best-effort before being freed, since the
/// keystore owns all in-memory key bytes per the data model's ownership rule.
pub struct KeyCache {
    mode: CacheMode,
    entries: HashMap<String, Vec<u8>>,
    recency: VecDeque<String>,
}

impl KeyCache {
    pub fn new(mode: CacheMode) -> Self {
        KeyCache {
            mode,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.mode, CacheMode::Disabled)
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        if self.is_disabled() {
            return None;
        }
        if let Some(bytes) = self.entries.get(key) {
            let bytes = bytes.clone();
            self.touch(key);
            Some(bytes)
        } else {
            None
        }
    }

    pub fn insert(&mut self, key: String, value: Vec<u8>) {
        if self.is_disabled() {
            return;
        }
        if self.entries.contains_key(&key) {
            self.touch(&key);
            self.entries.insert(key, value);
            return;
        }
        if let CacheMode::Bounded(cap) = self.mode {
            while self.entries.len() >= cap && !self.recency.is_empty() {
                self.evict_oldest();
            }
        }
        self.recency.push_back(key.clone());
        self.entries.insert(key, value);
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key.to_string());
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.recency.pop_front() {
            if let Some(mut bytes) = self.entries.remove(&oldest) {
                bytes.zeroize();
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        for (_, mut bytes) in self.entries.drain() {
            bytes.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_cache_never_returns_a_hit() {
        let mut cache = KeyCache::new(CacheMode::from_config(-1));
        cache.insert("k".to_string(), vec![1, 2, 3]);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn bounded_cache_evicts_least_recently_used() {
        let mut cache = KeyCache::new(CacheMode::Bounded(2));
        cache.insert("a".to_string(), vec![1]);
        cache.insert("b".to_string(), vec![2]);
        // touch "a" so "b" becomes the least recently used entry.
        assert!(cache.get("a").is_some());
        cache.insert("c".to_string(), vec![3]);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn unbounded_cache_never_evicts() {
        let mut cache = KeyCache::new(CacheMode::Unbounded);
        for i in 0..100 {
            cache.insert(format!("k{i}"), vec![i as u8]);
        }
        assert_eq!(cache.len(), 100);
    }
}
