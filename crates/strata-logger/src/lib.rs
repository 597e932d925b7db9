pub mod log;
pub mod severity;
pub mod systime;

pub use log::{enabled, log, max_level, set_max_level};
pub use severity::LogSeverity;
