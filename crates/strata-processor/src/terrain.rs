//! Deterministic terrain formulas shared by every generator.
//!
//! Heights, layers and caves are pure functions of world coordinates, so any
//! generator calling them agrees on layer boundaries. Ores are the only
//! random part: each call site supplies its own RNG.

use rand::Rng;
use strata_common::{Block, ChunkCoordinate, CHUNK_SIZE};

pub const BASE_HEIGHT: f64 = 64.0;
pub const MIN_HEIGHT: i32 = 1;
pub const MAX_HEIGHT: i32 = 250;

/// Octaves as (frequency, amplitude).
const OCTAVES: [(f64, f64); 4] = [(0.01, 24.0), (0.02, 12.0), (0.04, 6.0), (0.08, 3.0)];
const BIOME_FREQUENCY: f64 = 0.0025;

const CAVE_THRESHOLD: f64 = 0.3;
const DIRT_DEPTH: i32 = 3;

/// Ore bands, rarest first: (ore, highest world y, chance per stone block).
pub const ORE_BANDS: [(Block, i32, f64); 4] = [
    (Block::DiamondOre, 16, 0.002),
    (Block::GoldOre, 32, 0.004),
    (Block::IronOre, 64, 0.008),
    (Block::CoalOre, 128, 0.015),
];

/// Scales the octave amplitude between 0.5x (plains) and 1.5x (hills).
pub fn biome_modulation(world_x: f64, world_z: f64) -> f64 {
    1.0 + 0.5 * (world_x * BIOME_FREQUENCY).sin() * (world_z * BIOME_FREQUENCY).cos()
}

pub fn surface_height(world_x: i32, world_z: i32) -> i32 {
    let (wx, wz) = (world_x as f64, world_z as f64);
    let relief: f64 = OCTAVES
        .iter()
        .map(|&(frequency, amplitude)| {
            amplitude * 0.5 * ((wx * frequency).sin() + (wz * frequency).cos())
        })
        .sum();
    let height = BASE_HEIGHT + relief * biome_modulation(wx, wz);
    (height.floor() as i32).clamp(MIN_HEIGHT, MAX_HEIGHT)
}

/// Block for a world y given the column's surface height, before caves and ores.
pub fn layer_block(world_y: i32, height: i32) -> Block {
    if world_y <= 0 {
        Block::Bedrock
    } else if world_y < height - DIRT_DEPTH {
        Block::Stone
    } else if world_y < height {
        Block::Dirt
    } else if world_y == height {
        Block::Grass
    } else {
        Block::Air
    }
}

/// Product of two periodic 3D fields above a threshold.
pub fn is_cave(world_x: i32, world_y: i32, world_z: i32) -> bool {
    let (x, y, z) = (world_x as f64, world_y as f64, world_z as f64);
    let a = (x * 0.08).sin() * (y * 0.1).cos() * (z * 0.08 + 1.3).sin();
    let b = (x * 0.05 + z * 0.03).cos() * (y * 0.07 + 0.5).sin();
    a * b > CAVE_THRESHOLD
}

/// Independent draw per resource in its band, rarest first.
pub fn ore_at<R: Rng>(world_y: i32, rng: &mut R) -> Option<Block> {
    ORE_BANDS
        .iter()
        .filter(|(_, max_y, _)| world_y <= *max_y)
        .find(|(_, _, chance)| rng.gen::<f64>() < *chance)
        .map(|(ore, _, _)| *ore)
}

/// Final block at a world position.
pub fn block_at<R: Rng>(
    world_x: i32,
    world_y: i32,
    world_z: i32,
    height: i32,
    rng: &mut R,
) -> Block {
    let block = layer_block(world_y, height);
    if world_y > 0 && world_y < height - DIRT_DEPTH && is_cave(world_x, world_y, world_z) {
        return Block::Air;
    }
    if block == Block::Stone {
        return ore_at(world_y, rng).unwrap_or(Block::Stone);
    }
    block
}

/// World-space origin of a chunk. A missing y is treated as 0. Saturates
/// for coordinates beyond `MAX_CHUNK_COORD`.
pub fn chunk_origin(coord: &ChunkCoordinate) -> (i32, i32, i32) {
    let size = CHUNK_SIZE as i32;
    (
        coord.x.saturating_mul(size),
        coord.y.unwrap_or(0).saturating_mul(size),
        coord.z.saturating_mul(size),
    )
}

/// Fills one x-slab (`16 * 16` bytes, index `y * 16 + z`) of a chunk.
pub fn fill_slab<R: Rng>(coord: &ChunkCoordinate, local_x: usize, slab: &mut [u8], rng: &mut R) {
    let (ox, oy, oz) = chunk_origin(coord);
    let world_x = ox.saturating_add(local_x as i32);
    for local_z in 0..CHUNK_SIZE {
        let world_z = oz.saturating_add(local_z as i32);
        let height = surface_height(world_x, world_z);
        for local_y in 0..CHUNK_SIZE {
            let world_y = oy.saturating_add(local_y as i32);
            slab[local_y * CHUNK_SIZE + local_z] =
                block_at(world_x, world_y, world_z, height, rng).code();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use strata_common::MAX_CHUNK_COORD;

    #[test]
    fn test_surface_height_is_deterministic_and_bounded() {
        for (x, z) in [(0, 0), (-517, 90), (123_456, -98_765)] {
            let h = surface_height(x, z);
            assert_eq!(h, surface_height(x, z));
            assert!((MIN_HEIGHT..=MAX_HEIGHT).contains(&h));
        }
    }

    #[test]
    fn test_edge_of_world_chunks_generate() {
        let edge = ChunkCoordinate::voxel(MAX_CHUNK_COORD, -MAX_CHUNK_COORD, MAX_CHUNK_COORD);
        let (ox, oy, _) = chunk_origin(&edge);
        assert_eq!(ox, MAX_CHUNK_COORD * 16);
        assert_eq!(oy, -MAX_CHUNK_COORD * 16);

        // fields are public, so a raw coordinate can still be out of range
        let raw = ChunkCoordinate {
            dimension: strata_common::Dimension::Overworld,
            x: i32::MAX,
            y: Some(i32::MIN),
            z: i32::MIN,
        };
        assert_eq!(chunk_origin(&raw), (i32::MAX, i32::MIN, i32::MIN));

        let mut slab = [0u8; CHUNK_SIZE * CHUNK_SIZE];
        for coord in [&edge, &raw] {
            let mut rng = StepRng::new(0, 1);
            fill_slab(coord, CHUNK_SIZE - 1, &mut slab, &mut rng);
            // world y <= 0 is always bedrock
            assert!(slab.iter().all(|&b| b == Block::Bedrock.code()));
        }
    }

    #[test]
    fn test_layers() {
        assert_eq!(layer_block(0, 60), Block::Bedrock);
        assert_eq!(layer_block(-5, 60), Block::Bedrock);
        assert_eq!(layer_block(56, 60), Block::Stone);
        assert_eq!(layer_block(57, 60), Block::Dirt);
        assert_eq!(layer_block(59, 60), Block::Dirt);
        assert_eq!(layer_block(60, 60), Block::Grass);
        assert_eq!(layer_block(61, 60), Block::Air);
    }

    #[test]
    fn test_ore_bands() {
        // an RNG that always yields 0.0 makes every draw succeed
        let mut always = StepRng::new(0, 0);
        assert_eq!(ore_at(10, &mut always), Some(Block::DiamondOre));
        assert_eq!(ore_at(20, &mut always), Some(Block::GoldOre));
        assert_eq!(ore_at(50, &mut always), Some(Block::IronOre));
        assert_eq!(ore_at(100, &mut always), Some(Block::CoalOre));
        assert_eq!(ore_at(129, &mut always), None);

        let mut never = StepRng::new(u64::MAX, 0);
        assert_eq!(ore_at(10, &mut never), None);
    }

    #[test]
    fn test_caves_never_touch_bedrock_or_surface() {
        let mut never = StepRng::new(u64::MAX, 0);
        for x in -40..40 {
            let height = surface_height(x, 7);
            assert_eq!(block_at(x, 0, 7, height, &mut never), Block::Bedrock);
            assert_eq!(block_at(x, height, 7, height, &mut never), Block::Grass);
        }
    }
}
