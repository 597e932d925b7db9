use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T> = std::result::Result<T, crate::error::StrataError>;

/// Edge length of a chunk in blocks.
pub const CHUNK_SIZE: usize = 16;
/// Number of (x, z) columns in one chunk.
pub const COLUMN_COUNT: usize = CHUNK_SIZE * CHUNK_SIZE;
/// Number of voxels in one 16x16x16 chunk.
pub const VOXEL_COUNT: usize = CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE;
/// Chunks per region edge, used only for directory fan-out.
pub const REGION_SIZE: i32 = 32;
/// Largest chunk coordinate magnitude on any axis. Block coordinates of
/// every chunk in range fit in an `i32`.
pub const MAX_CHUNK_COORD: i32 = i32::MAX / CHUNK_SIZE as i32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Dimension {
    Overworld,
    Nether,
    End,
    Other(String),
}

impl Dimension {
    pub fn from_id(id: i64) -> Self {
        match id {
            0 => Dimension::Overworld,
            1 => Dimension::Nether,
            2 => Dimension::End,
            other => Dimension::Other(other.to_string()),
        }
    }

    /// Directory name for this dimension. Always a single path component.
    pub fn dir_name(&self) -> String {
        sanitize_name(self.name())
    }

    pub fn name(&self) -> &str {
        match self {
            Dimension::Overworld => "overworld",
            Dimension::Nether => "nether",
            Dimension::End => "end",
            Dimension::Other(name) => name,
        }
    }
}

impl From<&str> for Dimension {
    fn from(name: &str) -> Self {
        match name {
            "overworld" | "minecraft:overworld" => Dimension::Overworld,
            "nether" | "minecraft:the_nether" => Dimension::Nether,
            "end" | "minecraft:the_end" => Dimension::End,
            other => Dimension::Other(sanitize_name(other)),
        }
    }
}

/// Keeps ASCII letters, digits, `_` and `-`; everything else becomes `_`.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_owned()
    } else {
        cleaned
    }
}

impl From<String> for Dimension {
    fn from(name: String) -> Self {
        Dimension::from(name.as_str())
    }
}

impl From<Dimension> for String {
    fn from(dimension: Dimension) -> Self {
        dimension.name().to_owned()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cache and storage key. `y == None` means no Y-slice was specified and is
/// distinct from every explicit `Some(y)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoordinate {
    pub dimension: Dimension,
    pub x: i32,
    pub y: Option<i32>,
    pub z: i32,
}

impl ChunkCoordinate {
    /// Axes are clamped to `±MAX_CHUNK_COORD`.
    pub fn new(dimension: Dimension, x: i32, y: Option<i32>, z: i32) -> Self {
        Self {
            dimension,
            x: clamp_axis(x),
            y: y.map(clamp_axis),
            z: clamp_axis(z),
        }
    }

    /// Voxel chunk coordinate in the overworld.
    pub fn voxel(x: i32, y: i32, z: i32) -> Self {
        Self::new(Dimension::Overworld, x, Some(y), z)
    }

    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(
            self.dimension.clone(),
            self.x.saturating_add(dx),
            self.y.map(|y| y.saturating_add(dy)),
            self.z.saturating_add(dz),
        )
    }

    /// Whether every axis lies within `±MAX_CHUNK_COORD`.
    pub fn in_range(x: i32, y: i32, z: i32) -> bool {
        [x, y, z].iter().all(|axis| axis.unsigned_abs() <= MAX_CHUNK_COORD as u32)
    }

    /// Region directory this chunk belongs to.
    pub fn region(&self) -> (i32, i32) {
        (self.x.div_euclid(REGION_SIZE), self.z.div_euclid(REGION_SIZE))
    }

    fn y_part(&self) -> String {
        match self.y {
            Some(y) => y.to_string(),
            None => "all".to_owned(),
        }
    }

    /// `x,y,z` index key, with `all` standing in for a missing y.
    pub fn key(&self) -> String {
        format!("{},{},{}", self.x, self.y_part(), self.z)
    }

    /// Inverse of [`ChunkCoordinate::key`].
    pub fn parse_key(dimension: Dimension, key: &str) -> Option<Self> {
        let mut parts = key.split(',');
        let x = parts.next()?.trim().parse().ok()?;
        let y = match parts.next()?.trim() {
            "all" => None,
            y => Some(y.parse().ok()?),
        };
        let z = parts.next()?.trim().parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(dimension, x, y, z))
    }

    pub fn file_stem(&self) -> String {
        format!("c.{}.{}.{}", self.x, self.y_part(), self.z)
    }
}

impl fmt::Display for ChunkCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dimension, self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Chunk grid cell containing this position (floor division by 16),
    /// clamped to `±MAX_CHUNK_COORD`.
    pub fn chunk(&self) -> (i32, i32, i32) {
        let size = CHUNK_SIZE as f64;
        let axis = |v: f64| clamp_axis((v / size).floor() as i32);
        (axis(self.x), axis(self.y), axis(self.z))
    }
}

fn clamp_axis(v: i32) -> i32 {
    v.clamp(-MAX_CHUNK_COORD, MAX_CHUNK_COORD)
}

/// Top-of-column pixel and height for each of the 256 columns of a chunk,
/// indexed `z * 16 + x`. The alpha byte of every pixel is 0xFF.
#[derive(Clone, PartialEq, Eq)]
pub struct ColumnSlice {
    pixels: [u32; COLUMN_COUNT],
    heights: [u8; COLUMN_COUNT],
}

impl ColumnSlice {
    pub fn new(pixels: Vec<u32>, heights: Vec<u8>) -> std::result::Result<Self, DecodeError> {
        if pixels.len() != COLUMN_COUNT {
            return Err(DecodeError::WrongLength { len: pixels.len() });
        }
        if heights.len() != COLUMN_COUNT {
            return Err(DecodeError::WrongLength { len: heights.len() });
        }
        let mut pixel_array = [0u32; COLUMN_COUNT];
        pixel_array.copy_from_slice(&pixels);
        let mut height_array = [0u8; COLUMN_COUNT];
        height_array.copy_from_slice(&heights);
        Ok(Self::from_arrays(pixel_array, height_array))
    }

    pub fn from_arrays(mut pixels: [u32; COLUMN_COUNT], heights: [u8; COLUMN_COUNT]) -> Self {
        for pixel in pixels.iter_mut() {
            *pixel |= 0xFF00_0000;
        }
        Self { pixels, heights }
    }

    pub fn pixels(&self) -> &[u32; COLUMN_COUNT] {
        &self.pixels
    }

    pub fn heights(&self) -> &[u8; COLUMN_COUNT] {
        &self.heights
    }

    pub fn column(&self, x: usize, z: usize) -> (u32, u8) {
        let index = z * CHUNK_SIZE + x;
        (self.pixels[index], self.heights[index])
    }

    /// Columns reporting a non-zero height.
    pub fn non_empty_columns(&self) -> usize {
        self.heights.iter().filter(|&&h| h > 0).count()
    }
}

impl fmt::Debug for ColumnSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min = self.heights.iter().min().copied().unwrap_or(0);
        let max = self.heights.iter().max().copied().unwrap_or(0);
        f.debug_struct("ColumnSlice")
            .field("heights", &(min..=max))
            .field("first_pixel", &format_args!("{:#010x}", self.pixels[0]))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Block {
    Air = 0,
    Stone = 1,
    Dirt = 2,
    Grass = 3,
    Bedrock = 4,
    CoalOre = 5,
    IronOre = 6,
    GoldOre = 7,
    DiamondOre = 8,
}

impl Block {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Block::Air,
            1 => Block::Stone,
            2 => Block::Dirt,
            3 => Block::Grass,
            4 => Block::Bedrock,
            5 => Block::CoalOre,
            6 => Block::IronOre,
            7 => Block::GoldOre,
            8 => Block::DiamondOre,
            _ => return None,
        })
    }

    pub fn is_ore(self) -> bool {
        matches!(
            self,
            Block::CoalOre | Block::IronOre | Block::GoldOre | Block::DiamondOre
        )
    }
}

/// Dense 16x16x16 grid of block codes, indexed `(x * 16 + y) * 16 + z`.
#[derive(Clone, PartialEq, Eq)]
pub struct VoxelChunk {
    blocks: Box<[u8; VOXEL_COUNT]>,
}

impl VoxelChunk {
    pub fn new() -> Self {
        Self {
            blocks: Box::new([0u8; VOXEL_COUNT]),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != VOXEL_COUNT {
            return None;
        }
        let mut chunk = Self::new();
        chunk.blocks.copy_from_slice(bytes);
        Some(chunk)
    }

    #[inline]
    pub fn index(x: usize, y: usize, z: usize) -> usize {
        (x * CHUNK_SIZE + y) * CHUNK_SIZE + z
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> u8 {
        self.blocks[Self::index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, block: Block) {
        self.blocks[Self::index(x, y, z)] = block.code();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.blocks[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.blocks[..]
    }

    pub fn non_air_count(&self) -> usize {
        self.blocks.iter().filter(|&&b| b != Block::Air.code()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&b| b == Block::Air.code())
    }

    /// Every non-air voxel as `([x, y, z], code)`.
    pub fn iter_non_air(&self) -> impl Iterator<Item = ([u8; 3], u8)> + '_ {
        self.blocks.iter().enumerate().filter_map(|(index, &code)| {
            if code == Block::Air.code() {
                return None;
            }
            let z = index % CHUNK_SIZE;
            let y = (index / CHUNK_SIZE) % CHUNK_SIZE;
            let x = index / (CHUNK_SIZE * CHUNK_SIZE);
            Some(([x as u8, y as u8, z as u8], code))
        })
    }
}

impl Default for VoxelChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VoxelChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoxelChunk")
            .field("non_air", &self.non_air_count())
            .finish()
    }
}

/// Payload held by the cache and the region store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredChunk {
    Slice(ColumnSlice),
    Voxels(VoxelChunk),
}

impl StoredChunk {
    /// Non-air voxels, or columns with a reported height for slices.
    pub fn block_count(&self) -> u64 {
        match self {
            StoredChunk::Slice(slice) => slice.non_empty_columns() as u64,
            StoredChunk::Voxels(voxels) => voxels.non_air_count() as u64,
        }
    }

    pub fn as_slice(&self) -> Option<&ColumnSlice> {
        match self {
            StoredChunk::Slice(slice) => Some(slice),
            StoredChunk::Voxels(_) => None,
        }
    }

    pub fn as_voxels(&self) -> Option<&VoxelChunk> {
        match self {
            StoredChunk::Voxels(voxels) => Some(voxels),
            StoredChunk::Slice(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub timestamp: u64,
    pub size: u64,
    pub blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapBounds {
    pub min: [i32; 3],
    pub max: [i32; 3],
    pub total_chunks: usize,
    pub total_blocks: u64,
}
