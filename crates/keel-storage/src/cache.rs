//! LRU read cache for object backends.
//!
//! Objects never change once written, so cached entries are never stale and
//! the cache needs no invalidation. It is bounded both by object count and by
//! total payload bytes.

use crate::{GitObject, ObjectId, ObjectStoreBackend, ObjectType, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Configuration for the cache layer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of objects to cache.
    pub max_objects: usize,
    /// Maximum total payload size in bytes.
    pub max_size_bytes: usize,
    /// Objects larger than this are never cached.
    pub max_object_bytes: usize,
    /// Whether freshly written objects are cached.
    pub cache_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_objects: 10_000,
            max_size_bytes: 256 * 1024 * 1024,
            max_object_bytes: 4 * 1024 * 1024,
            cache_on_write: false,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of evictions.
    pub evictions: u64,
    /// Current number of cached objects.
    pub size: usize,
    /// Current payload bytes held.
    pub memory_bytes: usize,
}

impl CacheStats {
    /// Returns the cache hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entries {
    lru: LruCache<ObjectId, GitObject>,
    bytes: usize,
}

/// Wraps any backend with an LRU cache in front of `get`.
pub struct CachedStorage<S> {
    inner: S,
    entries: Mutex<Entries>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<S> CachedStorage<S> {
    /// Creates a new cached storage wrapper.
    pub fn new(inner: S, config: CacheConfig) -> Self {
        let max_objects = NonZeroUsize::new(config.max_objects).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            entries: Mutex::new(Entries {
                lru: LruCache::new(max_objects),
                bytes: 0,
            }),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a cached storage with default configuration.
    pub fn with_defaults(inner: S) -> Self {
        Self::new(inner, CacheConfig::default())
    }

    /// Returns the underlying storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: entries.lru.len(),
            memory_bytes: entries.bytes,
        }
    }

    /// Drops every cached object.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.lru.clear();
        entries.bytes = 0;
    }

    fn remember(&self, object: &GitObject) {
        let size = object.data.len();
        if size > self.config.max_object_bytes || size > self.config.max_size_bytes {
            return;
        }

        let mut entries = self.entries.lock();
        if entries.lru.contains(&object.id) {
            return;
        }
        while entries.bytes + size > self.config.max_size_bytes {
            match entries.lru.pop_lru() {
                Some((_, evicted)) => {
                    entries.bytes -= evicted.data.len();
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        if let Some((_, evicted)) = entries.lru.push(object.id, object.clone()) {
            entries.bytes -= evicted.data.len();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.bytes += size;
    }
}

impl<S: ObjectStoreBackend> ObjectStoreBackend for CachedStorage<S> {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        if self.config.cache_on_write {
            self.remember(&object);
        }
        self.inner.put(object)
    }

    fn get(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        if let Some(object) = self.entries.lock().lru.get(id).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(object));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let result = self.inner.get(id)?;
        if let Some(object) = &result {
            self.remember(object);
        }
        Ok(result)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        if self.entries.lock().lru.contains(id) {
            return Ok(true);
        }
        self.inner.contains(id)
    }

    fn header(&self, id: &ObjectId) -> Result<Option<(ObjectType, usize)>> {
        if let Some(object) = self.entries.lock().lru.peek(id) {
            return Ok(Some((object.object_type, object.size())));
        }
        self.inner.header(id)
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        self.inner.list_objects()
    }

    fn batch_put(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        if self.config.cache_on_write {
            for object in &objects {
                self.remember(object);
            }
        }
        self.inner.batch_put(objects)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;

    #[test]
    fn test_cache_miss_then_hit() {
        let backend = MemoryBackend::new();
        let obj = GitObject::blob(b"test data".to_vec());
        let id = backend.put(obj).unwrap();

        let cached = CachedStorage::with_defaults(backend);
        assert!(cached.get(&id).unwrap().is_some());
        assert!(cached.get(&id).unwrap().is_some());

        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.memory_bytes, 9);
    }

    #[test]
    fn test_cache_on_write() {
        let config = CacheConfig {
            cache_on_write: true,
            ..CacheConfig::default()
        };
        let cached = CachedStorage::new(MemoryBackend::new(), config);
        let id = cached.put(GitObject::blob(b"hot".to_vec())).unwrap();

        assert!(cached.get(&id).unwrap().is_some());
        assert_eq!(cached.stats().hits, 1);
    }

    #[test]
    fn test_missing_object_not_cached() {
        let cached = CachedStorage::with_defaults(MemoryBackend::new());
        assert!(cached.get(&ObjectId::ZERO).unwrap().is_none());
        assert_eq!(cached.stats().size, 0);
    }

    #[test]
    fn test_cache_eviction_by_bytes() {
        let config = CacheConfig {
            max_objects: 100,
            max_size_bytes: 50,
            max_object_bytes: 50,
            cache_on_write: true,
        };
        let cached = CachedStorage::new(MemoryBackend::new(), config);

        for i in 0..3 {
            let obj = GitObject::blob(format!("data-{}-padding-xx", i).into_bytes());
            cached.put(obj).unwrap();
        }

        let stats = cached.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
        assert!(stats.memory_bytes <= 50);
    }

    #[test]
    fn test_cache_eviction_by_count() {
        let config = CacheConfig {
            max_objects: 2,
            cache_on_write: true,
            ..CacheConfig::default()
        };
        let cached = CachedStorage::new(MemoryBackend::new(), config);
        for i in 0..5 {
            cached
                .put(GitObject::blob(format!("{}", i).into_bytes()))
                .unwrap();
        }
        let stats = cached.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.memory_bytes, 2);
        assert_eq!(stats.evictions, 3);
    }

    #[test]
    fn test_oversized_object_bypasses_cache() {
        let config = CacheConfig {
            max_object_bytes: 4,
            cache_on_write: true,
            ..CacheConfig::default()
        };
        let cached = CachedStorage::new(MemoryBackend::new(), config);
        let id = cached.put(GitObject::blob(b"too large".to_vec())).unwrap();
        assert_eq!(cached.stats().size, 0);
        assert!(cached.contains(&id).unwrap());
    }

    #[test]
    fn test_cache_clear() {
        let cached = CachedStorage::with_defaults(MemoryBackend::new());
        let id = cached.put(GitObject::blob(b"x".to_vec())).unwrap();
        cached.get(&id).unwrap();
        cached.clear();
        assert_eq!(cached.stats().size, 0);
        assert_eq!(cached.stats().memory_bytes, 0);
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats {
            hits: 8,
            misses: 2,
            ..CacheStats::default()
        };
        assert!((stats.hit_ratio() - 0.8).abs() < 0.001);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
