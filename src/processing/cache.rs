//! Bounded cache of decoded inputs, keyed by the encoded bytes

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::processing::decode::Decoded;

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub insertions: usize,
    pub evictions: usize,
}

struct Entry {
    hash: u64,
    input: Arc<[u8]>,
    decoded: Decoded,
    size: u64,
}

#[derive(Default)]
struct Inner {
    // Least recently used at the front
    entries: VecDeque<Entry>,
    memory: u64,
    stats: CacheStats,
}

/// Decoded-input cache bounded by entry count and bytes. Lookups return owned
/// copies so callers never share a buffer.
pub struct DecodeCache {
    max_items: usize,
    max_memory: u64,
    inner: Mutex<Inner>,
}

impl DecodeCache {
    /// Create a cache holding at most `max_items` entries and `max_memory` bytes
    pub fn new(max_items: usize, max_memory: u64) -> Self {
        Self {
            max_items,
            max_memory,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn key(input: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up a decoded copy of `input`
    pub fn get(&self, input: &[u8]) -> Option<Decoded> {
        let hash = Self::key(input);
        let mut inner = self.inner.lock().unwrap();

        let position = inner
            .entries
            .iter()
            .position(|entry| entry.hash == hash && &*entry.input == input);

        match position {
            Some(index) => {
                inner.stats.hits += 1;
                let entry = inner.entries.remove(index)?;
                let decoded = entry.decoded.clone();
                inner.entries.push_back(entry);
                debug!("Decode cache hit ({} bytes)", input.len());
                Some(decoded)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Store a decoded copy of `input`, evicting least recently used entries
    /// to stay within bounds. Entries larger than the whole budget are skipped.
    pub fn insert(&self, input: &[u8], decoded: &Decoded) {
        let size = input.len() as u64 + decoded.buffer.as_bytes().len() as u64;
        if self.max_items == 0 || size > self.max_memory {
            debug!("Decode cache skipped entry of {} bytes", size);
            return;
        }

        let hash = Self::key(input);
        let mut inner = self.inner.lock().unwrap();

        if inner
            .entries
            .iter()
            .any(|entry| entry.hash == hash && &*entry.input == input)
        {
            return;
        }

        while inner.entries.len() >= self.max_items || inner.memory + size > self.max_memory {
            match inner.entries.pop_front() {
                Some(evicted) => {
                    inner.memory -= evicted.size;
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }

        inner.entries.push_back(Entry {
            hash,
            input: Arc::from(input),
            decoded: decoded.clone(),
            size,
        });
        inner.memory += size;
        inner.stats.insertions += 1;
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held
    pub fn memory_usage(&self) -> u64 {
        self.inner.lock().unwrap().memory
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.memory = 0;
        debug!("Decode cache cleared");
    }
}
