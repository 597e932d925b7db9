use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use strata_codec::{compress_record, decompress_record};
use strata_common::{ChunkCoordinate, Dimension, Result, StoredChunk, StrataError, VoxelChunk};
use strata_logger::{log, LogSeverity};
use tokio::fs;
use tokio::sync::Mutex;

const SPILL_INDEX_FILE: &str = "spill_index.json";
const SPILL_INDEX_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SpillIndexFile {
    version: u16,
    /// dimension -> `x,y,z` key -> file path relative to the spill root
    chunks: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Default)]
struct SpillState {
    resident: HashMap<ChunkCoordinate, (Arc<VoxelChunk>, u64)>,
    order: BTreeMap<u64, ChunkCoordinate>,
    // Chunks chosen for spilling whose files are still being written.
    spilling: HashMap<ChunkCoordinate, Arc<VoxelChunk>>,
    spilled: HashMap<ChunkCoordinate, PathBuf>,
    next_tick: u64,
}

impl SpillState {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, coord: &ChunkCoordinate) -> Option<Arc<VoxelChunk>> {
        let tick = self.tick();
        let (chunk, old_tick) = self.resident.get_mut(coord)?;
        self.order.remove(&*old_tick);
        *old_tick = tick;
        self.order.insert(tick, coord.clone());
        Some(chunk.clone())
    }

    fn insert(&mut self, coord: ChunkCoordinate, chunk: Arc<VoxelChunk>) {
        let tick = self.tick();
        if let Some((_, old_tick)) = self.resident.insert(coord.clone(), (chunk, tick)) {
            self.order.remove(&old_tick);
        }
        self.order.insert(tick, coord);
    }

    fn take_oldest_quarter(&mut self) -> Vec<(ChunkCoordinate, Arc<VoxelChunk>)> {
        let count = (self.resident.len() + 3) / 4;
        let mut victims = Vec::with_capacity(count);
        for _ in 0..count {
            let Some((_, coord)) = self.order.pop_first() else {
                break;
            };
            if let Some((chunk, _)) = self.resident.remove(&coord) {
                self.spilling.insert(coord.clone(), chunk.clone());
                victims.push((coord, chunk));
            }
        }
        victims
    }

    fn index_file(&self, root: &Path) -> SpillIndexFile {
        let mut chunks: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (coord, path) in &self.spilled {
            let relative = path.strip_prefix(root).unwrap_or(path.as_path());
            chunks
                .entry(coord.dimension.name().to_owned())
                .or_default()
                .insert(coord.key(), relative.to_string_lossy().into_owned());
        }
        SpillIndexFile {
            version: SPILL_INDEX_VERSION,
            chunks,
        }
    }
}

/// Memory-bounded chunk cache that writes its least recently used quarter to
/// disk once more than `max_resident` chunks are held.
pub struct SpillCache {
    root: PathBuf,
    max_resident: usize,
    compression_level: u32,
    state: Mutex<SpillState>,
    index_lock: Mutex<()>,
}

impl SpillCache {
    pub async fn open(root: impl AsRef<Path>, max_resident: usize, compression_level: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut state = SpillState::default();
        match read_spill_index(&root).await {
            Ok(Some(file)) => {
                for (dimension, chunks) in file.chunks {
                    let dimension = Dimension::from(dimension);
                    for (key, relative) in chunks {
                        let relative = PathBuf::from(relative);
                        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
                            log(
                                format!("Skipping spill entry outside {}: {}", root.display(), relative.display()),
                                LogSeverity::Warning,
                            );
                            continue;
                        }
                        if let Some(coord) = ChunkCoordinate::parse_key(dimension.clone(), &key) {
                            state.spilled.insert(coord, root.join(relative));
                        }
                    }
                }
                log(
                    format!("Spill cache found {} spilled chunks", state.spilled.len()),
                    LogSeverity::Info,
                );
            }
            Ok(None) => {}
            Err(e) => log(format!("Ignoring spill index: {}", e), LogSeverity::Warning),
        }

        Ok(Self {
            root,
            max_resident: max_resident.max(1),
            compression_level,
            state: Mutex::new(state),
            index_lock: Mutex::new(()),
        })
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident
    }

    fn spill_path(&self, coord: &ChunkCoordinate) -> PathBuf {
        self.root
            .join(coord.dimension.dir_name())
            .join(format!("{}.spill", coord.file_stem()))
    }

    pub async fn get(&self, coord: &ChunkCoordinate) -> Option<Arc<VoxelChunk>> {
        let path = {
            let mut state = self.state.lock().await;
            if let Some(chunk) = state.touch(coord) {
                return Some(chunk);
            }
            if let Some(chunk) = state.spilling.get(coord) {
                return Some(chunk.clone());
            }
            state.spilled.get(coord).cloned()?
        };

        let chunk = match read_spilled(&path).await {
            Ok(chunk) => Arc::new(chunk),
            Err(e) => {
                log(
                    format!("Failed to reload spilled chunk {}: {}", coord, e),
                    LogSeverity::Error,
                );
                self.state.lock().await.spilled.remove(coord);
                return None;
            }
        };

        self.state.lock().await.spilled.remove(coord);
        let _ = fs::remove_file(&path).await;
        self.insert(coord.clone(), chunk.clone()).await;
        Some(chunk)
    }

    pub async fn contains(&self, coord: &ChunkCoordinate) -> bool {
        let state = self.state.lock().await;
        state.resident.contains_key(coord)
            || state.spilling.contains_key(coord)
            || state.spilled.contains_key(coord)
    }

    pub async fn insert(&self, coord: ChunkCoordinate, chunk: Arc<VoxelChunk>) {
        let (stale, victims) = {
            let mut state = self.state.lock().await;
            let stale = state.spilled.remove(&coord);
            state.insert(coord, chunk);
            let victims = if state.resident.len() > self.max_resident {
                state.take_oldest_quarter()
            } else {
                Vec::new()
            };
            (stale, victims)
        };

        if let Some(path) = stale {
            self.discard_spilled(&path).await;
        }
        if !victims.is_empty() {
            self.spill(victims).await;
        }
    }

    /// Deletes a spill file superseded by a fresh insert.
    async fn discard_spilled(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log(
                format!("Failed to remove stale spill file {}: {}", path.display(), e),
                LogSeverity::Warning,
            ),
        }
        if let Err(e) = self.save_index().await {
            log(format!("Failed to save spill index: {}", e), LogSeverity::Error);
        }
    }

    async fn spill(&self, victims: Vec<(ChunkCoordinate, Arc<VoxelChunk>)>) {
        let mut written = Vec::with_capacity(victims.len());
        let mut failed = Vec::new();
        for (coord, chunk) in victims {
            let path = self.spill_path(&coord);
            match write_spilled(&path, &chunk, self.compression_level).await {
                Ok(()) => written.push((coord, path)),
                Err(e) => {
                    log(
                        format!("Failed to spill chunk {}: {}", coord, e),
                        LogSeverity::Error,
                    );
                    failed.push(coord);
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            for coord in failed {
                state.spilling.remove(&coord);
            }
            for (coord, path) in written {
                // Skip chunks re-inserted while their file was being written.
                if state.spilling.remove(&coord).is_some() && !state.resident.contains_key(&coord) {
                    state.spilled.insert(coord, path);
                }
            }
        }

        log(
            format!("Spilled chunks to {}", self.root.display()),
            LogSeverity::Debug,
        );
        if let Err(e) = self.save_index().await {
            log(format!("Failed to save spill index: {}", e), LogSeverity::Error);
        }
    }

    pub async fn save_index(&self) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let file = self.state.lock().await.index_file(&self.root);
        let json = serde_json::to_vec_pretty(&file)?;
        let tmp = self.root.join(format!("{}.tmp", SPILL_INDEX_FILE));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, self.root.join(SPILL_INDEX_FILE)).await?;
        Ok(())
    }

    /// `(resident, spilled)` counts.
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.resident.len() + state.spilling.len(), state.spilled.len())
    }
}

async fn read_spill_index(root: &Path) -> Result<Option<SpillIndexFile>> {
    let bytes = match fs::read(root.join(SPILL_INDEX_FILE)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file: SpillIndexFile = serde_json::from_slice(&bytes)?;
    if file.version != SPILL_INDEX_VERSION {
        return Err(StrataError::Storage(format!(
            "unsupported spill index version {}",
            file.version
        )));
    }
    Ok(Some(file))
}

async fn write_spilled(path: &Path, chunk: &VoxelChunk, level: u32) -> Result<()> {
    let bytes = compress_record(&StoredChunk::Voxels(chunk.clone()), level)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, bytes).await?;
    Ok(())
}

async fn read_spilled(path: &Path) -> Result<VoxelChunk> {
    let bytes = fs::read(path).await?;
    match decompress_record(&bytes)? {
        StoredChunk::Voxels(chunk) => Ok(chunk),
        StoredChunk::Slice(_) => Err(StrataError::Storage(format!(
            "{} holds a column slice",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::Block;
    use tempfile::TempDir;

    fn chunk(marker: usize) -> Arc<VoxelChunk> {
        let mut chunk = VoxelChunk::new();
        chunk.set(marker % 16, 0, 0, Block::Stone);
        Arc::new(chunk)
    }

    #[tokio::test]
    async fn test_spills_oldest_quarter() {
        let dir = TempDir::new().unwrap();
        let cache = SpillCache::open(dir.path(), 8, 6).await.unwrap();

        for x in 0..8 {
            cache.insert(ChunkCoordinate::voxel(x, 0, 0), chunk(x as usize)).await;
        }
        assert_eq!(cache.counts().await, (8, 0));

        // touch 0 and 1 so that 2 and 3 are the oldest
        assert!(cache.get(&ChunkCoordinate::voxel(0, 0, 0)).await.is_some());
        assert!(cache.get(&ChunkCoordinate::voxel(1, 0, 0)).await.is_some());

        cache.insert(ChunkCoordinate::voxel(8, 0, 0), chunk(8)).await;
        // 9 resident, a quarter rounded up is 3
        assert_eq!(cache.counts().await, (6, 3));

        let spilled = dir.path().join("overworld").join("c.2.0.0.spill");
        assert!(spilled.exists());
        assert!(dir.path().join("spill_index.json").exists());
        assert!(!dir.path().join("overworld").join("c.0.0.0.spill").exists());
    }

    #[tokio::test]
    async fn test_spilled_chunks_reload() {
        let dir = TempDir::new().unwrap();
        let cache = SpillCache::open(dir.path(), 4, 6).await.unwrap();
        for x in 0..5 {
            cache.insert(ChunkCoordinate::voxel(x, 0, 0), chunk(x as usize)).await;
        }
        let first = ChunkCoordinate::voxel(0, 0, 0);
        assert_eq!(cache.counts().await, (3, 2));

        let reloaded = cache.get(&first).await.unwrap();
        assert_eq!(*reloaded, *chunk(0));
        assert!(cache.contains(&first).await);
    }

    #[tokio::test]
    async fn test_reinsert_removes_spill_file() {
        let dir = TempDir::new().unwrap();
        let cache = SpillCache::open(dir.path(), 4, 6).await.unwrap();
        for x in 0..5 {
            cache.insert(ChunkCoordinate::voxel(x, 0, 0), chunk(x as usize)).await;
        }
        let first = ChunkCoordinate::voxel(0, 0, 0);
        let file = dir.path().join("overworld").join("c.0.0.0.spill");
        assert_eq!(cache.counts().await, (3, 2));
        assert!(file.exists());

        cache.insert(first.clone(), chunk(9)).await;
        assert!(!file.exists());
        assert_eq!(cache.counts().await, (4, 1));
        assert_eq!(*cache.get(&first).await.unwrap(), *chunk(9));

        // the index no longer points at the removed file
        drop(cache);
        let reopened = SpillCache::open(dir.path(), 4, 6).await.unwrap();
        assert_eq!(reopened.counts().await, (0, 1));
        assert!(!reopened.contains(&first).await);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = SpillCache::open(dir.path(), 2, 6).await.unwrap();
            for x in 0..3 {
                cache.insert(ChunkCoordinate::voxel(x, 1, 0), chunk(x as usize)).await;
            }
            assert_eq!(cache.counts().await.1, 1);
        }

        let cache = SpillCache::open(dir.path(), 2, 6).await.unwrap();
        assert_eq!(cache.counts().await, (0, 1));
        let reloaded = cache.get(&ChunkCoordinate::voxel(0, 1, 0)).await.unwrap();
        assert_eq!(*reloaded, *chunk(0));
    }
}
