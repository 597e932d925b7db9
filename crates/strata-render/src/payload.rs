use serde::{Deserialize, Serialize};
use strata_common::{ChunkCoordinate, MapBounds, StoredChunk, VoxelChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderBlock {
    pub pos: [u8; 3],
    #[serde(rename = "type")]
    pub block_type: u8,
}

/// Sparse voxel chunk: only non-air blocks are listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderPayload {
    pub position: [i32; 3],
    pub blocks: Vec<RenderBlock>,
    pub count: usize,
}

impl RenderPayload {
    /// `None` for a chunk without any non-air voxel.
    pub fn from_voxels(coord: &ChunkCoordinate, voxels: &VoxelChunk) -> Option<Self> {
        let blocks: Vec<RenderBlock> = voxels
            .iter_non_air()
            .map(|(pos, block_type)| RenderBlock { pos, block_type })
            .collect();
        if blocks.is_empty() {
            return None;
        }
        Some(Self {
            position: [coord.x, coord.y.unwrap_or(0), coord.z],
            count: blocks.len(),
            blocks,
        })
    }

    /// Column slices carry no voxels and never render.
    pub fn from_stored(coord: &ChunkCoordinate, chunk: &StoredChunk) -> Option<Self> {
        match chunk {
            StoredChunk::Voxels(voxels) => Self::from_voxels(coord, voxels),
            StoredChunk::Slice(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullMap {
    pub bounds: MapBounds,
    pub total_chunks: usize,
    pub loaded_chunks: usize,
    pub chunks: Vec<RenderPayload>,
}
