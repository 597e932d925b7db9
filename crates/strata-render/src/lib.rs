pub mod payload;
pub mod renderer;

pub use payload::{FullMap, RenderBlock, RenderPayload};
pub use renderer::{visible_set, RenderOptions, RenderStats, Renderer, ViewUpdate};
