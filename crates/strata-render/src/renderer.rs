use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_common::config::{RenderConfig, MAX_VIEW_DISTANCE};
use strata_common::{ChunkCoordinate, Dimension, MapBounds, Position, StoredChunk};
use strata_logger::{log, LogSeverity};
use strata_processor::ChunkProcessor;
use strata_storage::ChunkCache;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::payload::{FullMap, RenderPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub dimension: Dimension,
    pub view_distance: i32,
    pub surface_min_chunk_y: i32,
    pub surface_max_chunk_y: i32,
    pub vertical_budget: i32,
    pub queue_capacity: usize,
    pub dispatch_batch: usize,
}

impl RenderOptions {
    pub fn in_surface_band(&self, chunk_y: i32) -> bool {
        (self.surface_min_chunk_y..=self.surface_max_chunk_y).contains(&chunk_y)
    }
}

impl From<&RenderConfig> for RenderOptions {
    fn from(config: &RenderConfig) -> Self {
        Self {
            dimension: config.dimension.clone(),
            view_distance: config.view_distance.clamp(0, MAX_VIEW_DISTANCE),
            surface_min_chunk_y: config.surface_min_chunk_y,
            surface_max_chunk_y: config.surface_max_chunk_y,
            vertical_budget: config.vertical_budget.max(0),
            queue_capacity: config.queue_capacity.max(1),
            dispatch_batch: config.dispatch_batch.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewUpdate {
    pub position: [f64; 3],
    pub chunk_position: [i32; 3],
    pub visible_chunks: usize,
    pub dispatched: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageSummary {
    pub stored_chunks: usize,
    pub map_bounds: MapBounds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderStats {
    pub viewer_position: [f64; 3],
    pub view_distance: i32,
    pub visible_chunk_count: usize,
    pub cache: CacheSummary,
    pub storage: StorageSummary,
}

/// Chunks around `center` worth showing, surface band first, nearest first.
///
/// Inside the surface band only horizontal distance counts. Outside it a
/// chunk must be within `vertical_budget` chunks vertically, and vertical
/// offsets weigh four times as much.
pub fn visible_set(center: (i32, i32, i32), options: &RenderOptions) -> Vec<ChunkCoordinate> {
    let (cx, cy, cz) = center;
    let vd = options.view_distance.clamp(0, MAX_VIEW_DISTANCE);
    let half = vd / 2;
    let limit = vd * vd;

    let mut visible = Vec::new();
    for dy in -half..=half {
        let Some(y) = cy.checked_add(dy) else {
            continue;
        };
        let in_band = options.in_surface_band(y);
        if !in_band && dy.abs() > options.vertical_budget {
            continue;
        }
        for dx in -vd..=vd {
            for dz in -vd..=vd {
                let horizontal = dx * dx + dz * dz;
                let distance = if in_band { horizontal } else { horizontal + 4 * dy * dy };
                if distance > limit {
                    continue;
                }
                // Cells past the edge of the world are skipped, not clamped.
                let (Some(x), Some(z)) = (cx.checked_add(dx), cz.checked_add(dz)) else {
                    continue;
                };
                if !ChunkCoordinate::in_range(x, y, z) {
                    continue;
                }
                visible.push((
                    !in_band,
                    distance,
                    ChunkCoordinate::new(options.dimension.clone(), x, Some(y), z),
                ));
            }
        }
    }

    visible.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    visible.into_iter().map(|(_, _, coord)| coord).collect()
}

struct ViewerState {
    position: [f64; 3],
    last_chunk: Option<(i32, i32, i32)>,
    visible: HashSet<ChunkCoordinate>,
}

struct RenderInner {
    options: RenderOptions,
    cache: Arc<ChunkCache>,
    processor: Arc<ChunkProcessor>,
    viewer: Mutex<ViewerState>,
    loaded: Mutex<HashSet<ChunkCoordinate>>,
    in_flight: Mutex<HashSet<ChunkCoordinate>>,
    queue_tx: mpsc::Sender<RenderPayload>,
    dropped: AtomicU64,
}

/// Tracks one viewer and streams render payloads for what it can see.
pub struct Renderer {
    inner: Arc<RenderInner>,
    queue_rx: Mutex<mpsc::Receiver<RenderPayload>>,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl Renderer {
    pub fn new(options: RenderOptions, cache: Arc<ChunkCache>, processor: Arc<ChunkProcessor>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(options.queue_capacity.max(1));
        let inner = RenderInner {
            viewer: Mutex::new(ViewerState {
                position: [0.0; 3],
                last_chunk: None,
                visible: HashSet::new(),
            }),
            loaded: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            queue_tx,
            dropped: AtomicU64::new(0),
            options,
            cache,
            processor,
        };
        Self {
            inner: Arc::new(inner),
            queue_rx: Mutex::new(queue_rx),
            loader: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.inner.options
    }

    pub async fn update_viewer_position(&self, x: f64, y: f64, z: f64) -> ViewUpdate {
        let options = &self.inner.options;
        let chunk = Position::new(x, y, z).chunk();
        let visible = visible_set(chunk, options);

        let visible_lookup: HashSet<ChunkCoordinate> = visible.iter().cloned().collect();
        let moved = {
            let mut viewer = self.inner.viewer.lock().await;
            viewer.position = [x, y, z];
            viewer.visible = visible_lookup.clone();
            let moved = viewer.last_chunk != Some(chunk);
            viewer.last_chunk = Some(chunk);
            moved
        };

        if moved {
            let cache = self.inner.cache.clone();
            let center = ChunkCoordinate::new(options.dimension.clone(), chunk.0, Some(chunk.1), chunk.2);
            let radius = options.view_distance / 2;
            tokio::spawn(async move {
                cache.prefetch(&center, radius).await;
            });
        }

        let wanted = {
            let mut loaded = self.inner.loaded.lock().await;
            // Chunks that left the view are streamed again when they return.
            loaded.retain(|coord| visible_lookup.contains(coord));
            let mut in_flight = self.inner.in_flight.lock().await;
            let mut wanted = Vec::new();
            for coord in &visible {
                if !loaded.contains(coord) && in_flight.insert(coord.clone()) {
                    wanted.push(coord.clone());
                }
            }
            wanted
        };

        let dispatched = wanted.len();
        if dispatched > 0 {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.dispatch(wanted).await });
        }

        ViewUpdate {
            position: [x, y, z],
            chunk_position: [chunk.0, chunk.1, chunk.2],
            visible_chunks: visible.len(),
            dispatched,
        }
    }

    /// Everything queued so far, waiting up to `timeout` for the first payload.
    pub async fn get_new_chunks(&self, timeout: Duration) -> Vec<RenderPayload> {
        let mut rx = self.queue_rx.lock().await;
        let mut chunks = Vec::new();

        match rx.try_recv() {
            Ok(payload) => chunks.push(payload),
            Err(_) if timeout.is_zero() => return chunks,
            Err(_) => match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(payload)) => chunks.push(payload),
                _ => return chunks,
            },
        }
        while let Ok(payload) = rx.try_recv() {
            chunks.push(payload);
        }
        chunks
    }

    /// Warms the cache from everything stored for the render dimension,
    /// surface band first. Only the first call spawns the loader.
    pub async fn start_background_loader(&self) {
        let mut loader = self.loader.lock().await;
        if loader.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *loader = Some(tokio::spawn(async move { inner.warm_cache().await }));
    }

    pub async fn stop_background_loader(&self) {
        if let Some(loader) = self.loader.lock().await.take() {
            loader.abort();
        }
    }

    pub async fn render_stats(&self) -> RenderStats {
        let (viewer_position, visible_chunk_count) = {
            let viewer = self.inner.viewer.lock().await;
            (viewer.position, viewer.visible.len())
        };
        let cache = self.inner.cache.stats().await;
        let store = self.inner.cache.store();

        RenderStats {
            viewer_position,
            view_distance: self.inner.options.view_distance,
            visible_chunk_count,
            cache: CacheSummary {
                size: cache.size,
                hits: cache.hits,
                misses: cache.misses,
                hit_rate: cache.hit_rate,
                memory_mb: cache.memory_bytes as f64 / (1024.0 * 1024.0),
            },
            storage: StorageSummary {
                stored_chunks: store.len().await,
                map_bounds: store.bounds().await,
            },
        }
    }

    /// Payloads for up to `limit` stored chunks of the render dimension.
    pub async fn full_map(&self, limit: usize) -> FullMap {
        let store = self.inner.cache.store();
        let coords: Vec<ChunkCoordinate> = store
            .coordinates_in(&self.inner.options.dimension)
            .await
            .into_iter()
            .take(limit)
            .collect();

        let cache = &self.inner.cache;
        let loaded = join_all(coords.iter().map(|coord| async move {
            let chunk = cache.get(coord).await?;
            RenderPayload::from_stored(coord, &chunk)
        }))
        .await;
        let chunks: Vec<RenderPayload> = loaded.into_iter().flatten().collect();

        FullMap {
            bounds: store.bounds().await,
            total_chunks: store.len().await,
            loaded_chunks: chunks.len(),
            chunks,
        }
    }

    pub async fn loaded_count(&self) -> usize {
        self.inner.loaded.lock().await.len()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }

    /// Payloads dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl RenderInner {
    async fn dispatch(&self, coords: Vec<ChunkCoordinate>) {
        for group in coords.chunks(self.options.dispatch_batch.max(1)) {
            join_all(group.iter().map(|coord| self.fetch_and_queue(coord))).await;
        }
    }

    async fn fetch_and_queue(&self, coord: &ChunkCoordinate) {
        let chunk = match self.cache.get(coord).await {
            Some(chunk) => Some(chunk),
            None => self.generate(coord).await,
        };

        let mut delivered = false;
        if let Some(chunk) = chunk {
            match RenderPayload::from_stored(coord, &chunk) {
                // Nothing to draw, but nothing to retry either.
                None => delivered = true,
                Some(payload) => match self.queue_tx.try_send(payload) {
                    Ok(()) => delivered = true,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        log(
                            format!("Render queue full, dropping chunk {}", coord),
                            LogSeverity::Debug,
                        );
                    }
                    Err(TrySendError::Closed(_)) => {}
                },
            }
        }

        if delivered && self.viewer.lock().await.visible.contains(coord) {
            self.loaded.lock().await.insert(coord.clone());
        }
        self.in_flight.lock().await.remove(coord);
    }

    async fn generate(&self, coord: &ChunkCoordinate) -> Option<StoredChunk> {
        match self.processor.process_chunk(coord.clone()).await.await {
            Ok(voxels) => {
                let chunk = StoredChunk::Voxels((*voxels).clone());
                // Persist failures are logged by the cache.
                let _ = self.cache.put(coord, &chunk, true).await;
                Some(chunk)
            }
            Err(e) => {
                log(
                    format!("Failed to generate chunk {}: {}", coord, e),
                    LogSeverity::Error,
                );
                None
            }
        }
    }

    async fn warm_cache(&self) {
        let store = self.cache.store();
        let (mut surface, rest): (Vec<_>, Vec<_>) = store
            .coordinates_in(&self.options.dimension)
            .await
            .into_iter()
            .partition(|coord| coord.y.map_or(false, |y| self.options.in_surface_band(y)));
        surface.extend(rest);

        let budget = self.cache.max_size();
        let mut warmed = 0;
        let targets: Vec<&ChunkCoordinate> = surface.iter().take(budget).collect();
        for group in targets.chunks(self.options.dispatch_batch.max(1)) {
            let results = join_all(group.iter().map(|coord| self.cache.warm(coord))).await;
            warmed += results.into_iter().filter(|ok| *ok).count();
        }
        log(
            format!("Background loader warmed {} of {} stored chunks", warmed, surface.len()),
            LogSeverity::Info,
        );
    }
}
