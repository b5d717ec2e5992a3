//! Bounded LRU caches.
//!
//! [`LruCache`] is a plain least-recently-used map: a `HashMap` from key to
//! slot index plus a doubly linked recency list threaded through a `Vec` of
//! nodes. Reads and writes both refresh recency; inserting into a full cache
//! evicts the least recently used entry.
//!
//! [`MetadataCache`] wraps it behind a mutex for sidecar lookups. Misses are
//! loaded from disk outside the lock; failed loads are not cached.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::metadata::{FileMetadata, MetadataError};

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A fixed-capacity least-recently-used map.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            head: None,
            tail: None,
            capacity: capacity.max(1),
        }
    }

    /// Look up a value and mark it most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.map.get(key)?;
        self.touch(idx);
        Some(&self.nodes[idx].value)
    }

    /// Look up a value without changing recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|&idx| &self.nodes[idx].value)
    }

    /// Insert or replace a value, marking it most recently used.
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = value;
            self.touch(idx);
            return None;
        }

        let evicted = if self.nodes.len() >= self.capacity {
            self.tail.map(|tail| {
                let node = self.remove_index(tail);
                (node.key, node.value)
            })
        } else {
            None
        };

        let idx = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.map.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    /// Remove an entry.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.map.get(key)?;
        Some(self.remove_index(idx).value)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.detach(idx);
            self.push_front(idx);
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        self.nodes[idx].prev = None;
        self.nodes[idx].next = old_head;
        match old_head {
            Some(h) => self.nodes[h].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    /// Unlink and remove the node at `idx`, moving the last node into its slot.
    fn remove_index(&mut self, idx: usize) -> Node<K, V> {
        self.detach(idx);
        let last = self.nodes.len() - 1;
        let node = self.nodes.swap_remove(idx);

        if idx != last {
            let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
            match prev {
                Some(p) => self.nodes[p].next = Some(idx),
                None => self.head = Some(idx),
            }
            match next {
                Some(n) => self.nodes[n].prev = Some(idx),
                None => self.tail = Some(idx),
            }
            if let Some(slot) = self.map.get_mut(&self.nodes[idx].key) {
                *slot = idx;
            }
        }

        self.map.remove(&node.key);
        node
    }
}

/// LRU cache of header sidecars keyed by sidecar path.
pub struct MetadataCache {
    inner: Mutex<LruCache<PathBuf, Arc<FileMetadata>>>,
}

impl MetadataCache {
    /// Default number of sidecars kept in memory.
    pub const DEFAULT_CAPACITY: usize = 2 << 16;

    /// Create a cache holding at most `capacity` sidecars.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached sidecar for `path`, loading it from disk on a miss.
    pub async fn get(&self, path: &Path) -> Option<Arc<FileMetadata>> {
        self.get_with(path, FileMetadata::read).await
    }

    /// Cached sidecar for `path`, running `load` on a miss.
    ///
    /// A failed load returns `None` and leaves the cache unchanged, so a
    /// sidecar written later is picked up by the next lookup.
    pub async fn get_with<F, Fut>(&self, path: &Path, load: F) -> Option<Arc<FileMetadata>>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<FileMetadata, MetadataError>>,
    {
        let hit = self.inner.lock().get(path).cloned();
        if hit.is_some() {
            return hit;
        }

        match load(path.to_path_buf()).await {
            Ok(meta) => {
                let meta = Arc::new(meta);
                self.insert(path.to_path_buf(), Arc::clone(&meta));
                Some(meta)
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load metadata sidecar");
                None
            }
        }
    }

    /// Insert or replace the sidecar stored at `meta.path()`.
    pub fn put(&self, meta: Arc<FileMetadata>) {
        self.insert(meta.path().to_path_buf(), meta);
    }

    /// Drop a cached sidecar.
    pub fn invalidate(&self, path: &Path) {
        self.inner.lock().remove(path);
    }

    /// Number of cached sidecars.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Maximum number of cached sidecars.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    fn insert(&self, path: PathBuf, meta: Arc<FileMetadata>) {
        if let Some((evicted, _)) = self.inner.lock().insert(path, meta) {
            debug!(path = %evicted.display(), "Evicted metadata sidecar");
        }
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
