pub mod config;
pub mod error;
pub mod types;

pub use error::{DecodeError, GenerationError, StrataError};
pub use types::*;
