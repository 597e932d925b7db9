pub mod generator;
pub mod handle;
pub mod processor;
pub mod spill;
pub mod terrain;

pub use generator::{AcceleratedGenerator, CpuGenerator, TerrainGenerator};
pub use handle::{GenerationResult, ResultHandle};
pub use processor::{ChunkProcessor, ProcessorOptions, ProcessorStats};
pub use spill::SpillCache;
