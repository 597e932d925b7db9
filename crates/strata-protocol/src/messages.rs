use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_common::{ChunkCoordinate, Dimension, Position, Result};
use strata_render::{RenderPayload, RenderStats};
use strata_storage::SliceRecord;
use uuid::Uuid;

/// `y` sent when a request carries no explicit slice.
pub const DEFAULT_SLICE_Y: i32 = 255;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(alias = "requestID", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_purpose: Option<String>,
}

impl MessageHeader {
    fn purpose_is(&self, purpose: &str) -> bool {
        self.message_purpose.as_deref() == Some(purpose)
    }

    pub fn is_command_response(&self) -> bool {
        self.purpose_is("commandResponse")
            || self.purpose_is("commandResult")
            || self.message_type.as_deref() == Some("commandResponse")
    }

    pub fn is_event(&self) -> bool {
        self.purpose_is("event")
    }
}

/// A message from the game client exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameMessage {
    #[serde(default)]
    pub header: MessageHeader,
    #[serde(default)]
    pub body: Value,
}

impl GameMessage {
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A command response carrying a `data` payload.
    ChunkData { header: MessageHeader, body: Value },
    PlayerTravelled {
        player: Option<String>,
        dimension: Dimension,
        position: Position,
    },
    PlayerJoined {
        id: String,
        name: String,
        position: Option<Position>,
    },
    Other(String),
}

impl InboundMessage {
    pub fn classify(message: GameMessage) -> Self {
        let GameMessage { header, body } = message;

        if header.is_command_response() && body.get("data").is_some() {
            return InboundMessage::ChunkData { header, body };
        }

        let event_name = header.event_name.clone().unwrap_or_default();
        let player = body.get("player");

        if header.is_event() && event_name == "PlayerTravelled" {
            if let Some(position) = player.and_then(|p| p.get("position")).and_then(read_position) {
                let player = player.and_then(|p| p.get("id")).map(value_to_string);
                let dimension = player_dimension(&body);
                return InboundMessage::PlayerTravelled {
                    player,
                    dimension,
                    position,
                };
            }
        } else if !header.is_event() {
            if let Some(player) = player {
                let id = player
                    .get("id")
                    .map(value_to_string)
                    .unwrap_or_else(|| "player".to_owned());
                let name = player
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| id.clone());
                let position = player.get("position").and_then(read_position);
                return InboundMessage::PlayerJoined { id, name, position };
            }
        }

        InboundMessage::Other(event_name)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read_position(value: &Value) -> Option<Position> {
    let axis = |name: &str| value.get(name).and_then(Value::as_f64);
    Some(Position::new(axis("x")?, axis("y")?, axis("z")?))
}

/// Dimension of a player event. Numeric ids and names are both accepted.
fn player_dimension(body: &Value) -> Dimension {
    match body.get("player").and_then(|p| p.get("dimension")) {
        Some(Value::Number(id)) => id.as_i64().map_or(Dimension::Overworld, Dimension::from_id),
        Some(Value::String(name)) => Dimension::from(name.as_str()),
        _ => Dimension::Overworld,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHeader {
    pub version: u32,
    pub request_id: String,
    pub event_name: String,
    pub message_type: String,
    pub message_purpose: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBody {
    pub command_line: String,
}

/// Command envelope sent to the game client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRequest {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl CommandRequest {
    /// `getchunkdata <dim> <x> <z> <y>` for one column slice.
    pub fn get_chunk_data(coord: &ChunkCoordinate) -> Self {
        let y = coord.y.unwrap_or(DEFAULT_SLICE_Y);
        Self {
            header: CommandHeader {
                version: 1,
                request_id: Uuid::new_v4().to_string(),
                event_name: "ChunkDataRequest".to_owned(),
                message_type: "commandRequest".to_owned(),
                message_purpose: "commandRequest".to_owned(),
            },
            body: CommandBody {
                command_line: format!(
                    "getchunkdata {} {} {} {}",
                    coord.dimension, coord.x, coord.z, y
                ),
            },
        }
    }

    pub fn request_id(&self) -> &str {
        &self.header.request_id
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages pushed to viewers, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Chunk {
        dimension: Dimension,
        x: i32,
        z: i32,
        y: Option<i32>,
        pixels: Vec<u32>,
        heights: Vec<u8>,
        #[serde(rename = "requestId")]
        request_id: Option<String>,
        timestamp: u64,
    },
    VoxelChunk(RenderPayload),
    Position {
        #[serde(rename = "playerId")]
        player_id: Option<String>,
        x: f64,
        y: f64,
        z: f64,
    },
    RenderStats(RenderStats),
    SessionInfo {
        #[serde(rename = "sessionId")]
        session_id: String,
        dimension: Dimension,
        #[serde(rename = "viewDistance")]
        view_distance: i32,
    },
    Error {
        message: String,
    },
}

impl OutboundMessage {
    pub fn chunk(record: &SliceRecord) -> Self {
        OutboundMessage::Chunk {
            dimension: record.dimension.clone(),
            x: record.x,
            z: record.z,
            y: record.y,
            pixels: record.slice.pixels().to_vec(),
            heights: record.slice.heights().to_vec(),
            request_id: record.request_id.clone(),
            timestamp: record.timestamp,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
