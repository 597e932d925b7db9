pub mod cache;
pub mod columns;
pub mod region;

pub use cache::{CacheStats, ChunkCache};
pub use columns::{ChunkMesh, ColumnStore, SliceRecord, StackEntry};
pub use region::RegionStore;
