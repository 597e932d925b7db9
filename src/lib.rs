//! Chunk pipeline: decode client column slices, persist them, generate voxel
//! chunks on demand and stream what a viewer can see.

pub use strata_codec as codec;
pub use strata_common as common;
pub use strata_logger as logger;
pub use strata_processor as processor;
pub use strata_protocol as protocol;
pub use strata_render as render;
pub use strata_storage as storage;

pub use strata_common::{ChunkCoordinate, Dimension, StrataError};
pub use strata_logger::{log, LogSeverity};
