pub mod pipeline;
pub mod server;

pub use pipeline::Pipeline;
pub use server::Server;
