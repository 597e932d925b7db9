use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use strata_common::{ChunkCoordinate, Position, Result};
use strata_logger::{log, LogSeverity};
use strata_protocol::{CommandRequest, GameMessage, InboundMessage, OutboundMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use uuid::Uuid;

use crate::pipeline::Pipeline;

/// Longest accepted line. A full chunk response is a few kilobytes.
const MAX_LINE_LENGTH: usize = 1 << 20;
/// How often queued render chunks are forwarded to the connection.
const RENDER_TICK: Duration = Duration::from_millis(250);
const STATS_TICK: Duration = Duration::from_secs(5);
/// Column slices requested around a travelling player.
const REQUEST_RADIUS: i32 = 1;

pub struct Server {
    pipeline: Arc<Pipeline>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(pipeline: Arc<Pipeline>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { pipeline, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => log(format!("Listening on {}", addr), LogSeverity::Info),
            Err(e) => log(format!("Listening on unknown address: {}", e), LogSeverity::Warning),
        }

        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log(format!("Failed to accept connection: {}", e), LogSeverity::Error);
                    continue;
                }
            };
            log(format!("New connection from: {}", addr), LogSeverity::Info);

            let pipeline = self.pipeline.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(pipeline, socket).await {
                    log(
                        format!("Connection {} closed with error: {}", addr, e),
                        LogSeverity::Error,
                    );
                } else {
                    log(format!("Connection {} closed", addr), LogSeverity::Info);
                }
            });
        }
    }
}

async fn handle_connection(pipeline: Arc<Pipeline>, socket: TcpStream) -> Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<CommandRequest>();

    let render = &pipeline.config().render;
    let hello = OutboundMessage::SessionInfo {
        session_id: Uuid::new_v4().to_string(),
        dimension: render.dimension.clone(),
        view_distance: render.view_distance,
    };
    framed.send(hello.to_line()?).await.map_err(codec_error)?;

    let mut render_tick = interval(RENDER_TICK);
    render_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_tick = interval(STATS_TICK);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately.
    stats_tick.tick().await;

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        framed
                            .send(OutboundMessage::error("line too long").to_line()?)
                            .await
                            .map_err(codec_error)?;
                        continue;
                    }
                    Some(Err(e)) => return Err(codec_error(e)),
                    None => return Ok(()),
                };
                for reply in handle_line(&pipeline, &command_tx, &line).await {
                    framed.send(reply.to_line()?).await.map_err(codec_error)?;
                }
            }
            Some(command) = command_rx.recv() => {
                framed.send(command.to_line()?).await.map_err(codec_error)?;
            }
            _ = render_tick.tick() => {
                for payload in pipeline.renderer().get_new_chunks(Duration::ZERO).await {
                    framed
                        .send(OutboundMessage::VoxelChunk(payload).to_line()?)
                        .await
                        .map_err(codec_error)?;
                }
            }
            _ = stats_tick.tick() => {
                let stats = pipeline.renderer().render_stats().await;
                framed
                    .send(OutboundMessage::RenderStats(stats).to_line()?)
                    .await
                    .map_err(codec_error)?;
            }
        }
    }
}

async fn handle_line(
    pipeline: &Pipeline,
    commands: &UnboundedSender<CommandRequest>,
    line: &str,
) -> Vec<OutboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    let message = match GameMessage::parse(line) {
        Ok(message) => message,
        Err(e) => {
            log(format!("Unreadable message: {}", e), LogSeverity::Warning);
            return vec![OutboundMessage::error(e.to_string())];
        }
    };

    match InboundMessage::classify(message) {
        InboundMessage::ChunkData { header, body } => {
            match pipeline.ingest().handle_chunk_response(&header, &body).await {
                Some(record) => vec![OutboundMessage::chunk(&record)],
                None => vec![OutboundMessage::error("chunk response could not be stored")],
            }
        }
        InboundMessage::PlayerTravelled {
            player,
            dimension,
            position,
        } => {
            pipeline
                .renderer()
                .update_viewer_position(position.x, position.y, position.z)
                .await;

            let (cx, _, cz) = position.chunk();
            let center = ChunkCoordinate::new(dimension, cx, Some(position.y.floor() as i32), cz);
            pipeline
                .ingest()
                .ensure_chunk_present(commands, &center, REQUEST_RADIUS)
                .await;

            vec![position_message(player, position)]
        }
        InboundMessage::PlayerJoined { id, name, position } => {
            log(format!("Identified player: {}", name), LogSeverity::Info);
            match position {
                Some(position) => {
                    pipeline
                        .renderer()
                        .update_viewer_position(position.x, position.y, position.z)
                        .await;
                    vec![position_message(Some(id), position)]
                }
                None => Vec::new(),
            }
        }
        InboundMessage::Other(event) => {
            if !event.is_empty() {
                log(format!("Ignoring event {}", event), LogSeverity::Debug);
            }
            Vec::new()
        }
    }
}

fn position_message(player_id: Option<String>, position: Position) -> OutboundMessage {
    OutboundMessage::Position {
        player_id,
        x: position.x,
        y: position.y,
        z: position.z,
    }
}

fn codec_error(e: LinesCodecError) -> strata_common::StrataError {
    match e {
        LinesCodecError::Io(e) => e.into(),
        other => strata_common::StrataError::Protocol(other.to_string()),
    }
}
