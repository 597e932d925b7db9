use crate::error::StrataError;
use crate::types::{Dimension, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "STRATA_CONFIG";
pub const DATA_DIR_ENV: &str = "STRATA_DATA_DIR";
pub const DEFAULT_CONFIG_FILE: &str = "strata.json";
/// Upper bound on `render.view_distance`, in chunks.
pub const MAX_VIEW_DISTANCE: i32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub processor: ProcessorConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Saves between index flushes.
    pub flush_every: usize,
    /// zlib level, 0-9.
    pub compression_level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub batch_linger_ms: u64,
    /// 0 picks the CPU count.
    pub workers: usize,
    pub accelerator: bool,
    pub memory_budget_mb: usize,
    pub spill_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub dimension: Dimension,
    pub view_distance: i32,
    pub surface_min_chunk_y: i32,
    pub surface_max_chunk_y: i32,
    pub vertical_budget: i32,
    pub queue_capacity: usize,
    pub dispatch_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            processor: ProcessorConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:25566".to_owned(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("world_data"),
            flush_every: 10,
            compression_level: 6,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            batch_linger_ms: 50,
            workers: 0,
            accelerator: true,
            memory_budget_mb: 256,
            spill_dir: PathBuf::from("chunk_cache"),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dimension: Dimension::Overworld,
            view_distance: 8,
            surface_min_chunk_y: 3,
            surface_max_chunk_y: 5,
            vertical_budget: 2,
            queue_capacity: 256,
            dispatch_batch: 8,
        }
    }
}

impl Config {
    /// Loads from `$STRATA_CONFIG`, else `strata.json` when it exists, else
    /// defaults, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| StrataError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StrataError::Config(e.to_string()))
    }

    pub fn apply_env(&mut self) {
        if let Some(dir) = env::var_os(DATA_DIR_ENV) {
            self.storage.data_dir = PathBuf::from(dir);
        }
    }

    /// Points both the world data and the spill directory under `root`.
    pub fn with_root(mut self, root: &Path) -> Self {
        self.storage.data_dir = root.join("world_data");
        self.processor.spill_dir = root.join("chunk_cache");
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 {
            return Err(StrataError::Config("cache.max_size must be > 0".into()));
        }
        if self.processor.batch_size == 0 {
            return Err(StrataError::Config("processor.batch_size must be > 0".into()));
        }
        if self.storage.flush_every == 0 {
            return Err(StrataError::Config("storage.flush_every must be > 0".into()));
        }
        if self.storage.compression_level > 9 {
            return Err(StrataError::Config(
                "storage.compression_level must be 0-9".into(),
            ));
        }
        if !(0..=MAX_VIEW_DISTANCE).contains(&self.render.view_distance) {
            return Err(StrataError::Config(format!(
                "render.view_distance must be 0-{}",
                MAX_VIEW_DISTANCE
            )));
        }
        if self.render.queue_capacity == 0 || self.render.dispatch_batch == 0 {
            return Err(StrataError::Config(
                "render.queue_capacity and render.dispatch_batch must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:25566");
        assert_eq!(config.storage.flush_every, 10);
        assert_eq!(config.processor.batch_linger_ms, 50);
        assert_eq!(config.render.dimension, Dimension::Overworld);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(
            r#"{"cache":{"max_size":5},"render":{"dimension":"nether","view_distance":3}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.max_size, 5);
        assert_eq!(config.render.dimension, Dimension::Nether);
        assert_eq!(config.render.view_distance, 3);
        assert_eq!(config.render.dispatch_batch, 8);
        assert_eq!(config.processor.batch_size, 16);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert_matches!(Config::from_json("{not json"), Err(StrataError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.cache.max_size = 0;
        assert_matches!(config.validate(), Err(StrataError::Config(_)));
    }

    #[test]
    fn test_validate_bounds_view_distance() {
        let mut config = Config::default();
        config.render.view_distance = MAX_VIEW_DISTANCE;
        assert!(config.validate().is_ok());
        config.render.view_distance = MAX_VIEW_DISTANCE + 1;
        assert_matches!(config.validate(), Err(StrataError::Config(_)));
        config.render.view_distance = -1;
        assert_matches!(config.validate(), Err(StrataError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{"log_level":"debug","storage":{{"flush_every":3}}}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.storage.flush_every, 3);

        let root = dir.path().join("run");
        let rooted = config.with_root(&root);
        assert_eq!(rooted.storage.data_dir, root.join("world_data"));
    }
}
