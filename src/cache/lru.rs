// src/cache/lru.rs
use super::key::CacheKey;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const NIL: usize = usize::MAX;

/// Snapshot of one cached response, handed out by `get`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    pub content_type: String,
    pub size_bytes: usize,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub max_size_bytes: usize,
    pub hit_rate: f64,
}

struct Node {
    key: CacheKey,
    body: Bytes,
    content_type: String,
    created_at: Instant,
    last_access_ms: AtomicU64,
    hit_count: AtomicU64,
    prev: usize,
    next: usize,
}

/// Map plus slab-backed recency list. Front of the list is MRU; eviction
/// walks from the tail. Every map entry owns exactly one list node.
struct Inner {
    map: HashMap<CacheKey, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    size_bytes: usize,
    max_size_bytes: usize,
    ttl: Duration,
}

impl Inner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("unlink of vacant slot");
            (node.prev, node.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.nodes[p].as_mut().expect("corrupt list").next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.nodes[n].as_mut().expect("corrupt list").prev = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        {
            let node = self.nodes[idx].as_mut().expect("push of vacant slot");
            node.prev = NIL;
            node.next = self.head;
        }
        match self.head {
            NIL => self.tail = idx,
            h => self.nodes[h].as_mut().expect("corrupt list").prev = idx,
        }
        self.head = idx;
    }

    /// Detach a node entirely: list, map, slab, and size accounting.
    fn remove_node(&mut self, idx: usize) -> Node {
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("remove of vacant slot");
        self.map.remove(&node.key);
        self.size_bytes -= node.body.len();
        self.free.push(idx);
        node
    }

    fn insert_front(&mut self, node: Node) -> usize {
        self.size_bytes += node.body.len();
        let key = node.key;
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
        idx
    }

    fn is_expired(&self, idx: usize) -> bool {
        let node = self.nodes[idx].as_ref().expect("expiry of vacant slot");
        node.created_at.elapsed() > self.ttl
    }
}

/// Size- and TTL-bounded response cache, content-addressed by `CacheKey`.
///
/// Reads share a lock and update access metadata through atomics without
/// reordering the recency list; only writers reorder. Stats counters are
/// atomic so `stats()` never blocks behind a writer for the counter part.
pub struct LruCache {
    enabled: bool,
    epoch: Instant,
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl LruCache {
    pub fn new(max_size_bytes: usize, ttl: Duration, enabled: bool) -> Self {
        debug!(
            max_size_bytes,
            ttl_secs = ttl.as_secs(),
            enabled,
            "Response cache initialized"
        );
        Self {
            enabled,
            epoch: Instant::now(),
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                size_bytes: 0,
                max_size_bytes,
                ttl,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }

        {
            let inner = self.inner.read().expect("cache lock poisoned");
            match inner.map.get(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(&idx) if !inner.is_expired(idx) => {
                    let node = inner.nodes[idx].as_ref().expect("corrupt slab");
                    let hit_count = node.hit_count.fetch_add(1, Ordering::Relaxed) + 1;
                    node.last_access_ms
                        .store(self.now_ms(), Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    // Recency order is refreshed by writers only; slightly
                    // stale LRU ordering in exchange for shared-lock reads.
                    return Some(CacheEntry {
                        body: node.body.clone(),
                        content_type: node.content_type.clone(),
                        size_bytes: node.body.len(),
                        hit_count,
                    });
                }
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, another thread may have
        // removed or replaced it meanwhile.
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let idx = inner.map.get(key).copied();
        if let Some(idx) = idx {
            if inner.is_expired(idx) {
                inner.remove_node(idx);
                self.expired.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "Cache entry expired");
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: CacheKey, body: Bytes, content_type: impl Into<String>) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.write().expect("cache lock poisoned");

        if body.len() > inner.max_size_bytes {
            debug!(
                %key,
                size = body.len(),
                max = inner.max_size_bytes,
                "Cache entry too large"
            );
            return;
        }

        let existing = inner.map.get(&key).copied();
        if let Some(idx) = existing {
            inner.remove_node(idx);
        }

        inner.insert_front(Node {
            key,
            body,
            content_type: content_type.into(),
            created_at: Instant::now(),
            last_access_ms: AtomicU64::new(self.now_ms()),
            hit_count: AtomicU64::new(0),
            prev: NIL,
            next: NIL,
        });

        self.evict_over_limit(&mut inner);
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.remove_node(idx);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let count = inner.map.len();
        inner.map.clear();
        inner.nodes.clear();
        inner.free.clear();
        inner.head = NIL;
        inner.tail = NIL;
        inner.size_bytes = 0;
        info!(entries = count, "Cache cleared");
    }

    /// Runtime re-tuning; shrinking the limit evicts immediately.
    pub fn update_config(&self, max_size_bytes: usize, ttl: Duration) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.max_size_bytes = max_size_bytes;
        inner.ttl = ttl;
        info!(max_size_bytes, ttl_secs = ttl.as_secs(), "Cache config updated");
        self.evict_over_limit(&mut inner);
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, size_bytes, max_size_bytes) = {
            let inner = self.inner.read().expect("cache lock poisoned");
            (inner.map.len(), inner.size_bytes, inner.max_size_bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            entries,
            size_bytes,
            max_size_bytes,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn evict_over_limit(&self, inner: &mut Inner) {
        while inner.size_bytes > inner.max_size_bytes && inner.tail != NIL {
            let victim = inner.remove_node(inner.tail);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim.key, size = victim.body.len(), "Evicted cache entry");
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.read().unwrap();
        let mut seen = 0;
        let mut bytes = 0;
        let mut idx = inner.head;
        let mut prev = NIL;
        while idx != NIL {
            let node = inner.nodes[idx].as_ref().expect("list points at vacant slot");
            assert_eq!(node.prev, prev);
            assert_eq!(inner.map.get(&node.key), Some(&idx));
            seen += 1;
            bytes += node.body.len();
            prev = idx;
            idx = node.next;
        }
        assert_eq!(inner.tail, prev);
        assert_eq!(seen, inner.map.len(), "every map entry has one list node");
        assert_eq!(bytes, inner.size_bytes);
        assert!(inner.size_bytes <= inner.max_size_bytes);
    }
}
