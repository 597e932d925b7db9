use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use strata_common::{
    ChunkCoordinate, ColumnSlice, Dimension, Result, StoredChunk, StrataError, CHUNK_SIZE,
    COLUMN_COUNT,
};
use strata_logger::systime::unix_timestamp;
use strata_logger::{log, LogSeverity};

use crate::cache::ChunkCache;

/// A decoded column slice as it was stored, with where and when it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceRecord {
    pub dimension: Dimension,
    pub x: i32,
    pub z: i32,
    pub y: Option<i32>,
    pub slice: ColumnSlice,
    pub timestamp: u64,
    pub request_id: Option<String>,
}

impl SliceRecord {
    pub fn coordinate(&self) -> ChunkCoordinate {
        ChunkCoordinate::new(self.dimension.clone(), self.x, self.y, self.z)
    }
}

/// One reported top block of a column, as seen by one stored Y slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackEntry {
    pub y: u8,
    pub pixel: u32,
    pub slice_y: Option<i32>,
}

/// Height-field mesh with one vertex per column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMesh {
    pub vertices: Vec<[f32; 3]>,
    pub indices: Vec<[u32; 3]>,
    /// RGBA per vertex.
    pub colors: Vec<[u8; 4]>,
}

impl ChunkMesh {
    /// Wavefront OBJ text, faces 1-based.
    pub fn to_obj(&self) -> String {
        let mut out = String::with_capacity(self.vertices.len() * 24 + self.indices.len() * 16);
        for [x, y, z] in &self.vertices {
            let _ = writeln!(out, "v {} {} {}", x, y, z);
        }
        for [a, b, c] in &self.indices {
            let _ = writeln!(out, "f {} {} {}", a + 1, b + 1, c + 1);
        }
        out
    }

    pub async fn save_obj(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, self.to_obj()).await?;
        Ok(())
    }
}

/// Column-slice view over the cache and the region store.
pub struct ColumnStore {
    cache: Arc<ChunkCache>,
}

impl ColumnStore {
    pub fn new(cache: Arc<ChunkCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Validates, caches and persists one decoded slice. A later slice for the
    /// same coordinate replaces this one.
    pub async fn store_chunk(
        &self,
        coord: ChunkCoordinate,
        pixels: Vec<u32>,
        heights: Vec<u8>,
        request_id: Option<String>,
        timestamp: Option<u64>,
    ) -> Result<SliceRecord> {
        let slice = ColumnSlice::new(pixels, heights)?;
        self.cache
            .put(&coord, &StoredChunk::Slice(slice.clone()), true)
            .await?;

        log(
            format!("Stored chunk {} (request={:?})", coord, request_id),
            LogSeverity::Info,
        );

        Ok(SliceRecord {
            dimension: coord.dimension,
            x: coord.x,
            z: coord.z,
            y: coord.y,
            slice,
            timestamp: timestamp.unwrap_or_else(unix_timestamp),
            request_id,
        })
    }

    pub async fn get_chunk(&self, coord: &ChunkCoordinate) -> Option<ColumnSlice> {
        match self.cache.get(coord).await? {
            StoredChunk::Slice(slice) => Some(slice),
            StoredChunk::Voxels(_) => None,
        }
    }

    async fn require_chunk(&self, coord: &ChunkCoordinate) -> Result<ColumnSlice> {
        self.get_chunk(coord)
            .await
            .ok_or_else(|| StrataError::NotFound(format!("chunk {}", coord)))
    }

    /// 256 stacks, one per column (`z * 16 + x`), holding the top block each
    /// stored Y slice reported for that column, lowest first.
    pub async fn assemble_chunk_column_stacks(
        &self,
        dimension: &Dimension,
        x: i32,
        z: i32,
    ) -> Vec<Vec<StackEntry>> {
        let mut stacks: Vec<Vec<StackEntry>> = vec![Vec::new(); COLUMN_COUNT];

        for coord in self.cache.store().column_slices(dimension, x, z).await {
            let Some(slice) = self.get_chunk(&coord).await else {
                continue;
            };
            for (i, stack) in stacks.iter_mut().enumerate() {
                stack.push(StackEntry {
                    y: slice.heights()[i],
                    pixel: slice.pixels()[i],
                    slice_y: coord.y,
                });
            }
        }

        for stack in stacks.iter_mut() {
            stack.sort_by_key(|entry| entry.y);
        }
        stacks
    }

    /// Heights as rows of z, columns of x.
    pub async fn chunk_heightmap(&self, coord: &ChunkCoordinate) -> Result<[[u8; CHUNK_SIZE]; CHUNK_SIZE]> {
        let slice = self.require_chunk(coord).await?;
        let mut map = [[0u8; CHUNK_SIZE]; CHUNK_SIZE];
        for (z, row) in map.iter_mut().enumerate() {
            row.copy_from_slice(&slice.heights()[z * CHUNK_SIZE..(z + 1) * CHUNK_SIZE]);
        }
        Ok(map)
    }

    pub async fn chunk_mesh(
        &self,
        coord: &ChunkCoordinate,
        height_scale: f32,
        tile_scale: f32,
    ) -> Result<ChunkMesh> {
        let slice = self.require_chunk(coord).await?;
        let size = CHUNK_SIZE as i64;

        let mut vertices = Vec::with_capacity(COLUMN_COUNT);
        let mut colors = Vec::with_capacity(COLUMN_COUNT);
        for rz in 0..CHUNK_SIZE {
            for cx in 0..CHUNK_SIZE {
                let (pixel, height) = slice.column(cx, rz);
                let world_x = (coord.x as i64 * size + cx as i64) as f32 * tile_scale;
                let world_z = (coord.z as i64 * size + rz as i64) as f32 * tile_scale;
                vertices.push([world_x, height as f32 * height_scale, world_z]);
                let [b, g, r, a] = pixel.to_le_bytes();
                colors.push([r, g, b, a]);
            }
        }

        let row = CHUNK_SIZE as u32;
        let mut indices = Vec::with_capacity((row as usize - 1).pow(2) * 2);
        for rz in 0..row - 1 {
            for cx in 0..row - 1 {
                let tl = rz * row + cx;
                let tr = tl + 1;
                let bl = tl + row;
                let br = bl + 1;
                indices.push([tl, bl, tr]);
                indices.push([tr, bl, br]);
            }
        }

        Ok(ChunkMesh {
            vertices,
            indices,
            colors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionStore;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    async fn columns(dir: &TempDir) -> ColumnStore {
        let store = RegionStore::open(dir.path(), 10, 6).await.unwrap();
        ColumnStore::new(Arc::new(ChunkCache::new(Arc::new(store), 64)))
    }

    fn ramp(offset: u8) -> (Vec<u32>, Vec<u8>) {
        let pixels = (0..256u32).map(|i| 0x0010_2030 + i).collect();
        let heights = (0..256usize).map(|i| (i % 16) as u8 + offset).collect();
        (pixels, heights)
    }

    #[tokio::test]
    async fn test_store_chunk_validates_lengths() {
        let dir = TempDir::new().unwrap();
        let columns = columns(&dir).await;
        let coord = ChunkCoordinate::new(Dimension::Overworld, 0, None, 0);

        assert_matches!(
            columns
                .store_chunk(coord.clone(), vec![0; 10], vec![0; 256], None, None)
                .await,
            Err(StrataError::Decode(_))
        );
        assert!(columns.get_chunk(&coord).await.is_none());
    }

    #[tokio::test]
    async fn test_store_and_get_chunk() {
        let dir = TempDir::new().unwrap();
        let columns = columns(&dir).await;
        let coord = ChunkCoordinate::new(Dimension::Overworld, 3, Some(10), -4);
        let (pixels, heights) = ramp(0);

        let record = columns
            .store_chunk(coord.clone(), pixels, heights, Some("req-1".into()), Some(42))
            .await
            .unwrap();
        assert_eq!(record.coordinate(), coord);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.request_id.as_deref(), Some("req-1"));

        let slice = columns.get_chunk(&coord).await.unwrap();
        assert_eq!(slice, record.slice);
        assert_eq!(slice.pixels()[0], 0xFF10_2030);
        assert!(columns.cache().store().exists(&coord).await);
    }

    #[tokio::test]
    async fn test_column_stacks_are_sorted() {
        let dir = TempDir::new().unwrap();
        let columns = columns(&dir).await;
        let (pixels, high) = ramp(100);
        let (_, low) = ramp(1);

        columns
            .store_chunk(ChunkCoordinate::new(Dimension::End, 0, Some(20), 0), pixels.clone(), low, None, None)
            .await
            .unwrap();
        columns
            .store_chunk(ChunkCoordinate::new(Dimension::End, 0, Some(10), 0), pixels, high, None, None)
            .await
            .unwrap();

        let stacks = columns.assemble_chunk_column_stacks(&Dimension::End, 0, 0).await;
        assert_eq!(stacks.len(), 256);
        for stack in &stacks {
            assert_eq!(stack.len(), 2);
            assert!(stack[0].y <= stack[1].y);
        }
        assert_eq!(stacks[5][0].slice_y, Some(20));
        assert_eq!(stacks[5][1].slice_y, Some(10));

        let other = columns.assemble_chunk_column_stacks(&Dimension::Nether, 0, 0).await;
        assert!(other.iter().all(|stack| stack.is_empty()));
    }

    #[tokio::test]
    async fn test_heightmap_and_mesh() {
        let dir = TempDir::new().unwrap();
        let columns = columns(&dir).await;
        let coord = ChunkCoordinate::new(Dimension::Overworld, 1, None, 2);
        let (pixels, heights) = ramp(0);
        columns
            .store_chunk(coord.clone(), pixels, heights, None, None)
            .await
            .unwrap();

        let map = columns.chunk_heightmap(&coord).await.unwrap();
        assert_eq!(map[7][3], 3);

        let mesh = columns.chunk_mesh(&coord, 2.0, 1.0).await.unwrap();
        assert_eq!(mesh.vertices.len(), 256);
        assert_eq!(mesh.indices.len(), 15 * 15 * 2);
        assert_eq!(mesh.vertices[17], [17.0, 2.0, 33.0]);
        assert_eq!(mesh.colors[0], [0x10, 0x20, 0x30, 0xFF]);
        assert_eq!(mesh.indices[0], [0, 16, 1]);

        let obj = mesh.to_obj();
        assert_eq!(obj.lines().filter(|l| l.starts_with("v ")).count(), 256);
        assert!(obj.contains("f 1 17 2"));

        let far = ChunkCoordinate {
            dimension: Dimension::Overworld,
            x: i32::MAX,
            y: None,
            z: i32::MIN,
        };
        let (pixels, heights) = ramp(0);
        columns.store_chunk(far.clone(), pixels, heights, None, None).await.unwrap();
        let mesh = columns.chunk_mesh(&far, 1.0, 1.0).await.unwrap();
        assert_eq!(mesh.vertices[0][0], (i32::MAX as i64 * 16) as f32);
        assert_eq!(mesh.vertices[0][2], (i32::MIN as i64 * 16) as f32);

        let missing = ChunkCoordinate::new(Dimension::Overworld, 9, None, 9);
        assert_matches!(
            columns.chunk_heightmap(&missing).await,
            Err(StrataError::NotFound(_))
        );
        assert_matches!(
            columns.chunk_mesh(&missing, 1.0, 1.0).await,
            Err(StrataError::NotFound(_))
        );
    }
}
