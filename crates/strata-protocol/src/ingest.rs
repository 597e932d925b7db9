use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use strata_common::{ChunkCoordinate, Dimension, Result, StrataError};
use strata_logger::{log, LogSeverity};
use strata_storage::{ColumnStore, SliceRecord};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::messages::{CommandRequest, MessageHeader};

/// Issues `getchunkdata` requests and stores the slices that come back.
pub struct ChunkIngest {
    columns: Arc<ColumnStore>,
    requests: Mutex<HashMap<String, ChunkCoordinate>>,
}

impl ChunkIngest {
    pub fn new(columns: Arc<ColumnStore>) -> Self {
        Self {
            columns,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn columns(&self) -> &Arc<ColumnStore> {
        &self.columns
    }

    /// Queues a request for `coord` on `sink` and remembers which coordinate
    /// the returned request id stands for.
    pub async fn request_chunk(
        &self,
        sink: &UnboundedSender<CommandRequest>,
        coord: ChunkCoordinate,
    ) -> Result<String> {
        let request = CommandRequest::get_chunk_data(&coord);
        let request_id = request.request_id().to_owned();

        self.requests
            .lock()
            .await
            .insert(request_id.clone(), coord.clone());

        if sink.send(request).is_err() {
            self.requests.lock().await.remove(&request_id);
            return Err(StrataError::Protocol("command sink closed".to_owned()));
        }

        log(
            format!("Requested chunk {} with requestId={}", coord, request_id),
            LogSeverity::Info,
        );
        Ok(request_id)
    }

    /// Decodes and stores a chunk response. Coordinates come from the body
    /// when it names them, otherwise from the request the response answers.
    /// Anything that cannot be decoded or stored is logged and dropped.
    pub async fn handle_chunk_response(&self, header: &MessageHeader, body: &Value) -> Option<SliceRecord> {
        let requested = match &header.request_id {
            Some(id) => self.requests.lock().await.remove(id),
            None => None,
        };

        let coord = match response_coordinate(body, requested.as_ref()) {
            Some(coord) => coord,
            None => {
                log(
                    format!("Chunk response missing coordinates: {}", body),
                    LogSeverity::Warning,
                );
                return None;
            }
        };

        let data = match body.get("data").and_then(Value::as_str) {
            Some(data) => data,
            None => {
                log("Chunk response missing data field".to_owned(), LogSeverity::Warning);
                return None;
            }
        };

        let slice = match strata_codec::decode(data) {
            Ok(slice) => slice,
            Err(e) => {
                log(
                    format!("Failed to decode chunk {}: {}", coord, e),
                    LogSeverity::Error,
                );
                return None;
            }
        };

        match self
            .columns
            .store_chunk(
                coord,
                slice.pixels().to_vec(),
                slice.heights().to_vec(),
                header.request_id.clone(),
                None,
            )
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                log(format!("Failed to store chunk: {}", e), LogSeverity::Error);
                None
            }
        }
    }

    /// Requests every column slice in the square of `radius` around `center`
    /// (same y) that is neither stored nor already requested.
    pub async fn ensure_chunk_present(
        &self,
        sink: &UnboundedSender<CommandRequest>,
        center: &ChunkCoordinate,
        radius: i32,
    ) -> Vec<String> {
        let radius = radius.max(0);
        let mut requested = Vec::new();
        for dx in -radius..=radius {
            for dz in -radius..=radius {
                let coord = center.offset(dx, 0, dz);
                if self.columns.cache().exists(&coord).await {
                    continue;
                }
                if !self.pending_request_ids(&coord).await.is_empty() {
                    continue;
                }
                match self.request_chunk(sink, coord.clone()).await {
                    Ok(id) => requested.push(id),
                    Err(e) => log(
                        format!("Failed to request chunk {}: {}", coord, e),
                        LogSeverity::Error,
                    ),
                }
            }
        }
        requested
    }

    /// Outstanding request ids for exactly `coord`, y included.
    pub async fn pending_request_ids(&self, coord: &ChunkCoordinate) -> Vec<String> {
        let requests = self.requests.lock().await;
        let mut ids: Vec<String> = requests
            .iter()
            .filter(|(_, pending)| *pending == coord)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn pending_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

fn lookup<'a>(body: &'a Value, keys: &[&str], nested: &str) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| body.get(*key).filter(|v| !v.is_null()))
        .or_else(|| body.get("position").and_then(|p| p.get(nested)))
        .filter(|v| !v.is_null())
}

fn lookup_i32(body: &Value, keys: &[&str], nested: &str) -> Option<i32> {
    let value = lookup(body, keys, nested)?;
    let number = match value {
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        other => other.as_f64()?,
    };
    Some(number.floor() as i32)
}

fn response_coordinate(body: &Value, requested: Option<&ChunkCoordinate>) -> Option<ChunkCoordinate> {
    let x = lookup_i32(body, &["x", "chunkX"], "x");
    let z = lookup_i32(body, &["z", "chunkZ"], "z");
    let y = lookup_i32(body, &["y", "chunkY"], "y");

    match (x, z) {
        (Some(x), Some(z)) => {
            let dimension = match lookup(body, &["dimension", "world", "dimensionName"], "dimension") {
                Some(Value::Number(id)) => id.as_i64().map_or(Dimension::Overworld, Dimension::from_id),
                Some(Value::String(name)) => Dimension::from(name.as_str()),
                _ => requested.map_or(Dimension::Overworld, |c| c.dimension.clone()),
            };
            let y = y.or_else(|| requested.and_then(|c| c.y));
            Some(ChunkCoordinate::new(dimension, x, y, z))
        }
        _ => requested.cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_common::MAX_CHUNK_COORD;
    use strata_storage::{ChunkCache, RegionStore};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn ingest(dir: &TempDir) -> ChunkIngest {
        let store = RegionStore::open(dir.path(), 10, 6).await.unwrap();
        let cache = Arc::new(ChunkCache::new(Arc::new(store), 16));
        ChunkIngest::new(Arc::new(ColumnStore::new(cache)))
    }

    fn header(request_id: Option<&str>) -> MessageHeader {
        MessageHeader {
            request_id: request_id.map(str::to_owned),
            message_purpose: Some("commandResponse".to_owned()),
            ..MessageHeader::default()
        }
    }

    #[tokio::test]
    async fn test_response_resolved_through_request_id() {
        let dir = TempDir::new().unwrap();
        let ingest = ingest(&dir).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let coord = ChunkCoordinate::new(Dimension::Nether, 3, Some(10), -2);
        let id = ingest.request_chunk(&tx, coord.clone()).await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.request_id(), id);
        assert_eq!(ingest.pending_request_ids(&coord).await, vec![id.clone()]);

        let record = ingest
            .handle_chunk_response(&header(Some(&id)), &json!({"data": "TaRoRg*255"}))
            .await
            .unwrap();
        assert_eq!(record.coordinate(), coord);
        assert_eq!(record.request_id.as_deref(), Some(id.as_str()));
        assert!(record.slice.heights().iter().all(|h| *h == 0x46));
        assert!(ingest.pending_request_ids(&coord).await.is_empty());
        assert!(ingest.columns().get_chunk(&coord).await.is_some());
    }

    #[tokio::test]
    async fn test_response_coordinates_from_body() {
        let dir = TempDir::new().unwrap();
        let ingest = ingest(&dir).await;

        let body = json!({"data": "TaRoRg*255", "dimensionName": "end", "position": {"x": 4, "z": "5"}, "chunkY": 0});
        let record = ingest.handle_chunk_response(&header(None), &body).await.unwrap();
        assert_eq!(record.coordinate(), ChunkCoordinate::new(Dimension::End, 4, Some(0), 5));
    }

    #[tokio::test]
    async fn test_far_coordinates_are_clamped() {
        let dir = TempDir::new().unwrap();
        let ingest = ingest(&dir).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let body = json!({"data": "TaRoRg*255", "x": 1e12, "z": "-1e12"});
        let record = ingest.handle_chunk_response(&header(None), &body).await.unwrap();
        assert_eq!((record.x, record.z), (MAX_CHUNK_COORD, -MAX_CHUNK_COORD));

        // neighbours past the edge collapse onto the edge row and are asked for once
        let center = ChunkCoordinate::new(Dimension::Overworld, MAX_CHUNK_COORD, Some(3), MAX_CHUNK_COORD);
        let requested = ingest.ensure_chunk_present(&tx, &center, 1).await;
        assert_eq!(requested.len(), 4);
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_bad_responses_are_dropped() {
        let dir = TempDir::new().unwrap();
        let ingest = ingest(&dir).await;

        // no coordinates and no known request
        assert!(ingest
            .handle_chunk_response(&header(Some("unknown")), &json!({"data": "TaRoRg*255"}))
            .await
            .is_none());
        // undecodable payload
        assert!(ingest
            .handle_chunk_response(&header(None), &json!({"data": "5", "x": 0, "z": 0}))
            .await
            .is_none());
        // wrong length
        assert!(ingest
            .handle_chunk_response(&header(None), &json!({"data": "TaRoRg*10", "x": 0, "z": 0}))
            .await
            .is_none());
        assert!(ingest.columns().cache().store().is_empty().await);
    }

    #[tokio::test]
    async fn test_ensure_chunk_present_skips_known() {
        let dir = TempDir::new().unwrap();
        let ingest = ingest(&dir).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let center = ChunkCoordinate::new(Dimension::Overworld, 0, None, 0);
        ingest
            .handle_chunk_response(&header(None), &json!({"data": "TaRoRg*255", "x": 0, "z": 0}))
            .await
            .unwrap();

        let first = ingest.ensure_chunk_present(&tx, &center, 1).await;
        assert_eq!(first.len(), 8);
        // everything is now stored or pending
        let second = ingest.ensure_chunk_present(&tx, &center, 1).await;
        assert!(second.is_empty());
        assert_eq!(ingest.pending_count().await, 8);

        let mut lines = Vec::new();
        while let Ok(request) = rx.try_recv() {
            lines.push(request.body.command_line);
        }
        assert_eq!(lines.len(), 8);
        assert!(lines.contains(&"getchunkdata overworld -1 1 255".to_owned()));
    }

    #[tokio::test]
    async fn test_closed_sink_forgets_request() {
        let dir = TempDir::new().unwrap();
        let ingest = ingest(&dir).await;
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        assert!(ingest.request_chunk(&tx, ChunkCoordinate::voxel(0, 0, 0)).await.is_err());
        assert_eq!(ingest.pending_count().await, 0);
    }
}
