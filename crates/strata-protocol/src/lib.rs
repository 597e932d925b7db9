//! Newline-delimited JSON messages exchanged with the game client and with
//! viewers, plus the ingest path that turns chunk responses into stored slices.

pub mod ingest;
pub mod messages;

pub use ingest::ChunkIngest;
pub use messages::{CommandRequest, GameMessage, InboundMessage, MessageHeader, OutboundMessage};
