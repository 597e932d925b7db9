use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use strata_codec::{compress_record, decompress_record};
use strata_common::{
    ChunkCoordinate, ChunkMetadata, Dimension, MapBounds, Result, StoredChunk, StrataError,
};
use strata_logger::systime::unix_timestamp;
use strata_logger::{log, LogSeverity};
use tokio::fs;
use tokio::sync::Mutex;

const INDEX_MAGIC: &str = "STRATA-INDEX";
const INDEX_VERSION: u16 = 1;
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    magic: String,
    version: u16,
    chunks: BTreeMap<String, ChunkMetadata>,
}

#[derive(Default)]
struct StoreIndex {
    chunks: HashMap<ChunkCoordinate, ChunkMetadata>,
    dirty: HashSet<Dimension>,
    saves_since_flush: usize,
}

impl StoreIndex {
    fn snapshot(&mut self, dimensions: &[Dimension]) -> Vec<(Dimension, IndexFile)> {
        dimensions
            .iter()
            .map(|dimension| {
                let chunks = self
                    .chunks
                    .iter()
                    .filter(|(coord, _)| &coord.dimension == dimension)
                    .map(|(coord, meta)| (coord.key(), *meta))
                    .collect();
                self.dirty.remove(dimension);
                (
                    dimension.clone(),
                    IndexFile {
                        magic: INDEX_MAGIC.to_owned(),
                        version: INDEX_VERSION,
                        chunks,
                    },
                )
            })
            .collect()
    }
}

/// Durable chunk store laid out as
/// `<root>/<dimension>/r.<rx>.<rz>/c.<x>.<y>.<z>.dat` with one JSON index
/// per dimension.
pub struct RegionStore {
    root: PathBuf,
    flush_every: usize,
    compression_level: u32,
    index: Mutex<StoreIndex>,
    // Serialises index writes so an older snapshot never lands after a newer one.
    flush_lock: Mutex<()>,
}

impl RegionStore {
    pub async fn open(root: impl AsRef<Path>, flush_every: usize, compression_level: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut index = StoreIndex::default();
        let mut dirs = fs::read_dir(&root).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dimension = Dimension::from(entry.file_name().to_string_lossy().into_owned());
            let path = entry.path().join(INDEX_FILE);
            match read_index(&path).await {
                Ok(Some(file)) => {
                    for (key, meta) in file.chunks {
                        match ChunkCoordinate::parse_key(dimension.clone(), &key) {
                            Some(coord) => {
                                index.chunks.insert(coord, meta);
                            }
                            None => log(
                                format!("Skipping malformed index key {:?} in {}", key, path.display()),
                                LogSeverity::Warning,
                            ),
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => log(
                    format!("Failed to read index {}: {}", path.display(), e),
                    LogSeverity::Error,
                ),
            }
        }

        log(
            format!("Region store at {} holds {} chunks", root.display(), index.chunks.len()),
            LogSeverity::Info,
        );

        Ok(Self {
            root,
            flush_every: flush_every.max(1),
            compression_level,
            index: Mutex::new(index),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    fn dimension_dir(&self, dimension: &Dimension) -> PathBuf {
        self.root.join(dimension.dir_name())
    }

    pub fn chunk_path(&self, coord: &ChunkCoordinate) -> PathBuf {
        let (rx, rz) = coord.region();
        self.dimension_dir(&coord.dimension)
            .join(format!("r.{}.{}", rx, rz))
            .join(format!("{}.dat", coord.file_stem()))
    }

    pub async fn exists(&self, coord: &ChunkCoordinate) -> bool {
        if self.index.lock().await.chunks.contains_key(coord) {
            return true;
        }
        fs::try_exists(self.chunk_path(coord)).await.unwrap_or(false)
    }

    pub async fn metadata(&self, coord: &ChunkCoordinate) -> Option<ChunkMetadata> {
        self.index.lock().await.chunks.get(coord).copied()
    }

    /// Reads a chunk back. Any failure is logged and reported as absent.
    pub async fn load(&self, coord: &ChunkCoordinate) -> Option<StoredChunk> {
        let path = self.chunk_path(coord);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                log(
                    format!("Failed to read chunk {} from {}: {}", coord, path.display(), e),
                    LogSeverity::Error,
                );
                return None;
            }
        };

        match decompress_record(&bytes) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                log(
                    format!("Corrupt chunk file {}: {}", path.display(), e),
                    LogSeverity::Error,
                );
                None
            }
        }
    }

    pub async fn save(&self, coord: &ChunkCoordinate, chunk: &StoredChunk) -> Result<ChunkMetadata> {
        let bytes = compress_record(chunk, self.compression_level)?;
        self.save_compressed(coord, &bytes, chunk.block_count()).await
    }

    /// Writes an already compressed record and records its metadata.
    pub async fn save_compressed(
        &self,
        coord: &ChunkCoordinate,
        bytes: &[u8],
        blocks: u64,
    ) -> Result<ChunkMetadata> {
        let path = self.chunk_path(coord);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;

        let meta = ChunkMetadata {
            timestamp: unix_timestamp(),
            size: bytes.len() as u64,
            blocks,
        };

        let flush_due = {
            let mut index = self.index.lock().await;
            index.chunks.insert(coord.clone(), meta);
            index.dirty.insert(coord.dimension.clone());
            index.saves_since_flush += 1;
            index.saves_since_flush >= self.flush_every
        };

        if flush_due {
            self.flush().await?;
        }
        Ok(meta)
    }

    /// Writes every dirty dimension index.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let snapshots = {
            let mut index = self.index.lock().await;
            index.saves_since_flush = 0;
            let dirty: Vec<Dimension> = index.dirty.iter().cloned().collect();
            index.snapshot(&dirty)
        };

        let mut snapshots = snapshots.into_iter();
        while let Some((dimension, file)) = snapshots.next() {
            if let Err(e) = self.write_index(&dimension, &file).await {
                // Unwritten dimensions stay dirty for the next flush.
                let mut index = self.index.lock().await;
                index.dirty.insert(dimension);
                index.dirty.extend(snapshots.by_ref().map(|(dimension, _)| dimension));
                return Err(e);
            }
            log(
                format!("Flushed {} index ({} chunks)", dimension, file.chunks.len()),
                LogSeverity::Debug,
            );
        }
        Ok(())
    }

    async fn write_index(&self, dimension: &Dimension, file: &IndexFile) -> Result<()> {
        let dir = self.dimension_dir(dimension);
        fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(file)?;
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, dir.join(INDEX_FILE)).await?;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all_coordinates(&self) -> Vec<ChunkCoordinate> {
        let mut coords: Vec<_> = self.index.lock().await.chunks.keys().cloned().collect();
        coords.sort();
        coords
    }

    pub async fn coordinates_in(&self, dimension: &Dimension) -> Vec<ChunkCoordinate> {
        let mut coords: Vec<_> = self
            .index
            .lock()
            .await
            .chunks
            .keys()
            .filter(|coord| &coord.dimension == dimension)
            .cloned()
            .collect();
        coords.sort();
        coords
    }

    /// Every stored Y slice of one chunk column.
    pub async fn column_slices(&self, dimension: &Dimension, x: i32, z: i32) -> Vec<ChunkCoordinate> {
        let mut coords: Vec<_> = self
            .index
            .lock()
            .await
            .chunks
            .keys()
            .filter(|coord| &coord.dimension == dimension && coord.x == x && coord.z == z)
            .cloned()
            .collect();
        coords.sort();
        coords
    }

    pub async fn bounds(&self) -> MapBounds {
        let index = self.index.lock().await;
        let mut entries = index.chunks.iter();
        let Some((first, meta)) = entries.next() else {
            return MapBounds::default();
        };

        let point = |c: &ChunkCoordinate| [c.x, c.y.unwrap_or(0), c.z];
        let mut bounds = MapBounds {
            min: point(first),
            max: point(first),
            total_chunks: 1,
            total_blocks: meta.blocks,
        };
        for (coord, meta) in entries {
            let p = point(coord);
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(p[axis]);
                bounds.max[axis] = bounds.max[axis].max(p[axis]);
            }
            bounds.total_chunks += 1;
            bounds.total_blocks += meta.blocks;
        }
        bounds
    }
}

async fn read_index(path: &Path) -> Result<Option<IndexFile>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file: IndexFile = serde_json::from_slice(&bytes)?;
    if file.magic != INDEX_MAGIC {
        return Err(StrataError::Storage(format!("bad index magic {:?}", file.magic)));
    }
    if file.version != INDEX_VERSION {
        return Err(StrataError::Storage(format!(
            "unsupported index version {}",
            file.version
        )));
    }
    Ok(Some(file))
}
