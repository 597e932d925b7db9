use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_codec::{compress_record, decompress_record};
use strata_common::{ChunkCoordinate, Result, StoredChunk};
use strata_logger::{log, LogSeverity};
use tokio::sync::Mutex;

use crate::region::RegionStore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub memory_bytes: usize,
}

struct CacheEntry {
    bytes: Bytes,
    tick: u64,
}

/// Entries keyed by coordinate, plus a tick-ordered view for recency.
#[derive(Default)]
struct LruState {
    entries: HashMap<ChunkCoordinate, CacheEntry>,
    order: BTreeMap<u64, ChunkCoordinate>,
    next_tick: u64,
    memory_bytes: usize,
}

impl LruState {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, coord: &ChunkCoordinate) -> Option<Bytes> {
        let tick = self.tick();
        let entry = self.entries.get_mut(coord)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, coord.clone());
        Some(entry.bytes.clone())
    }

    fn insert(&mut self, coord: ChunkCoordinate, bytes: Bytes) {
        let tick = self.tick();
        self.memory_bytes += bytes.len();
        if let Some(old) = self.entries.insert(coord.clone(), CacheEntry { bytes, tick }) {
            self.order.remove(&old.tick);
            self.memory_bytes -= old.bytes.len();
        }
        self.order.insert(tick, coord);
    }

    /// Inserts unless the coordinate is already cached, in which case the
    /// cached bytes are touched and returned instead.
    fn insert_if_absent(&mut self, coord: ChunkCoordinate, bytes: Bytes) -> Option<Bytes> {
        if let Some(existing) = self.touch(&coord) {
            return Some(existing);
        }
        self.insert(coord, bytes);
        None
    }

    /// Drops least recently used entries until at most `capacity` remain.
    fn evict_to(&mut self, capacity: usize) -> Vec<ChunkCoordinate> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let Some((_, coord)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&coord) {
                self.memory_bytes -= entry.bytes.len();
            }
            evicted.push(coord);
        }
        evicted
    }
}

/// Bounded LRU of compressed chunks in front of a [`RegionStore`].
///
/// The lock only guards the entry map and recency order; compression and
/// store I/O always happen outside it.
pub struct ChunkCache {
    store: Arc<RegionStore>,
    max_size: usize,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ChunkCache {
    pub fn new(store: Arc<RegionStore>, max_size: usize) -> Self {
        Self {
            store,
            max_size: max_size.max(1),
            state: Mutex::new(LruState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<RegionStore> {
        &self.store
    }

    pub async fn get(&self, coord: &ChunkCoordinate) -> Option<StoredChunk> {
        let cached = self.state.lock().await.touch(coord);

        if let Some(bytes) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            match decompress_record(&bytes) {
                Ok(chunk) => return Some(chunk),
                Err(e) => {
                    log(
                        format!("Dropping unreadable cache entry {}: {}", coord, e),
                        LogSeverity::Error,
                    );
                    self.remove(coord).await;
                }
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        self.load_from_store(coord).await
    }

    /// Caches `chunk` and, when `persist` is set, writes it through to the
    /// store. The memory copy is kept even when the write fails.
    pub async fn put(&self, coord: &ChunkCoordinate, chunk: &StoredChunk, persist: bool) -> Result<()> {
        let bytes = Bytes::from(compress_record(chunk, self.store.compression_level())?);
        self.insert(coord.clone(), bytes.clone()).await;

        if persist {
            if let Err(e) = self
                .store
                .save_compressed(coord, &bytes, chunk.block_count())
                .await
            {
                log(
                    format!("Failed to persist chunk {}: {}", coord, e),
                    LogSeverity::Error,
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Warms the cache with stored chunks in a cube around `center`. The y
    /// axis is only walked when the centre has a y. Returns the number loaded.
    pub async fn prefetch(&self, center: &ChunkCoordinate, radius: i32) -> usize {
        let radius = radius.max(0);
        let dys: Vec<i32> = match center.y {
            Some(_) => (-radius..=radius).collect(),
            None => vec![0],
        };

        let mut wanted = Vec::new();
        for dx in -radius..=radius {
            for &dy in &dys {
                for dz in -radius..=radius {
                    let coord = center.offset(dx, dy, dz);
                    if self.exists_in_cache(&coord).await || !self.store.exists(&coord).await {
                        continue;
                    }
                    wanted.push(coord);
                }
            }
        }

        let loaded = join_all(wanted.iter().map(|coord| self.load_from_store(coord))).await;
        let count = loaded.iter().filter(|chunk| chunk.is_some()).count();
        if count > 0 {
            log(
                format!("Prefetched {} chunks around {}", count, center),
                LogSeverity::Debug,
            );
        }
        count
    }

    /// Loads a stored chunk into memory without touching hit/miss counters.
    /// Returns whether the chunk is cached afterwards.
    pub async fn warm(&self, coord: &ChunkCoordinate) -> bool {
        self.exists_in_cache(coord).await || self.load_from_store(coord).await.is_some()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn exists_in_cache(&self, coord: &ChunkCoordinate) -> bool {
        self.state.lock().await.entries.contains_key(coord)
    }

    pub async fn exists(&self, coord: &ChunkCoordinate) -> bool {
        self.exists_in_cache(coord).await || self.store.exists(coord).await
    }

    pub async fn stats(&self) -> CacheStats {
        let (size, memory_bytes) = {
            let state = self.state.lock().await;
            (state.entries.len(), state.memory_bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            max_size: self.max_size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            memory_bytes,
        }
    }

    /// Reads a chunk from the store into the cache. A `put` that lands while
    /// the store is being read wins over the stored copy.
    async fn load_from_store(&self, coord: &ChunkCoordinate) -> Option<StoredChunk> {
        let chunk = self.store.load(coord).await?;
        let bytes = match compress_record(&chunk, self.store.compression_level()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                log(
                    format!("Failed to cache chunk {}: {}", coord, e),
                    LogSeverity::Warning,
                );
                return Some(chunk);
            }
        };

        let (newer, evicted) = {
            let mut state = self.state.lock().await;
            let newer = state.insert_if_absent(coord.clone(), bytes);
            (newer, state.evict_to(self.max_size))
        };
        self.record_evictions(evicted);

        match newer {
            Some(bytes) => decompress_record(&bytes).ok().or(Some(chunk)),
            None => Some(chunk),
        }
    }

    async fn insert(&self, coord: ChunkCoordinate, bytes: Bytes) {
        let evicted = {
            let mut state = self.state.lock().await;
            state.insert(coord, bytes);
            state.evict_to(self.max_size)
        };
        self.record_evictions(evicted);
    }

    fn record_evictions(&self, evicted: Vec<ChunkCoordinate>) {
        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            for coord in &evicted {
                log(format!("Evicted chunk {} from cache", coord), LogSeverity::Debug);
            }
        }
    }

    async fn remove(&self, coord: &ChunkCoordinate) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.remove(coord) {
            state.order.remove(&entry.tick);
            state.memory_bytes -= entry.bytes.len();
        }
    }
}
