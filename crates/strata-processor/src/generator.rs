use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use strata_common::{ChunkCoordinate, GenerationError, VoxelChunk, CHUNK_SIZE};
use strata_logger::{log, LogSeverity};

use crate::terrain::fill_slab;

const SLAB_LEN: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Chunk generation capability.
pub trait TerrainGenerator: Send + Sync {
    fn generate(&self, coord: &ChunkCoordinate) -> Result<VoxelChunk, GenerationError>;

    fn generate_batch(&self, coords: &[ChunkCoordinate]) -> Result<Vec<VoxelChunk>, GenerationError> {
        coords.iter().map(|coord| self.generate(coord)).collect()
    }

    /// Whether this generator runs whole batches in bulk.
    fn is_accelerated(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Scalar generator, one voxel at a time on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuGenerator;

impl TerrainGenerator for CpuGenerator {
    fn generate(&self, coord: &ChunkCoordinate) -> Result<VoxelChunk, GenerationError> {
        let mut rng = rand::thread_rng();
        let mut chunk = VoxelChunk::new();
        for (x, slab) in chunk.as_bytes_mut().chunks_mut(SLAB_LEN).enumerate() {
            fill_slab(coord, x, slab, &mut rng);
        }
        Ok(chunk)
    }

    fn is_accelerated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}

/// Bulk generator running every slab of every chunk in a batch on a
/// dedicated rayon pool.
pub struct AcceleratedGenerator {
    pool: ThreadPool,
}

impl AcceleratedGenerator {
    /// Builds the pool, or returns `None` when it cannot be created.
    /// `threads == 0` sizes it from the CPU count.
    pub fn probe(threads: usize) -> Option<Self> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        match ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("strata-gen-{}", idx))
            .build()
        {
            Ok(pool) => {
                log(
                    format!("Accelerated generation enabled with {} threads", threads),
                    LogSeverity::Info,
                );
                Some(Self { pool })
            }
            Err(e) => {
                log(
                    format!("Accelerated generation unavailable: {}", e),
                    LogSeverity::Warning,
                );
                None
            }
        }
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn fill(coord: &ChunkCoordinate, chunk: &mut VoxelChunk) {
        chunk
            .as_bytes_mut()
            .par_chunks_mut(SLAB_LEN)
            .enumerate()
            .for_each_init(rand::thread_rng, |rng, (x, slab)| {
                fill_slab(coord, x, slab, rng)
            });
    }
}

impl TerrainGenerator for AcceleratedGenerator {
    fn generate(&self, coord: &ChunkCoordinate) -> Result<VoxelChunk, GenerationError> {
        let mut chunk = VoxelChunk::new();
        self.pool.install(|| Self::fill(coord, &mut chunk));
        Ok(chunk)
    }

    fn generate_batch(&self, coords: &[ChunkCoordinate]) -> Result<Vec<VoxelChunk>, GenerationError> {
        Ok(self.pool.install(|| {
            coords
                .par_iter()
                .map(|coord| {
                    let mut chunk = VoxelChunk::new();
                    Self::fill(coord, &mut chunk);
                    chunk
                })
                .collect()
        }))
    }

    fn is_accelerated(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "accelerated"
    }
}
