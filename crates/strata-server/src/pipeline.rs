use std::sync::Arc;
use strata_common::config::Config;
use strata_common::Result;
use strata_logger::{log, LogSeverity};
use strata_processor::{ChunkProcessor, ProcessorOptions};
use strata_protocol::ChunkIngest;
use strata_render::{RenderOptions, Renderer};
use strata_storage::{ChunkCache, ColumnStore, RegionStore};

/// Every long-lived component, wired once and shared by all connections.
pub struct Pipeline {
    config: Config,
    store: Arc<RegionStore>,
    cache: Arc<ChunkCache>,
    columns: Arc<ColumnStore>,
    processor: Arc<ChunkProcessor>,
    renderer: Arc<Renderer>,
    ingest: Arc<ChunkIngest>,
}

impl Pipeline {
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = &config.storage;
        let store = Arc::new(
            RegionStore::open(&storage.data_dir, storage.flush_every, storage.compression_level)
                .await?,
        );
        let cache = Arc::new(ChunkCache::new(store.clone(), config.cache.max_size));
        let columns = Arc::new(ColumnStore::new(cache.clone()));
        let processor = Arc::new(
            ChunkProcessor::open(ProcessorOptions::from_config(
                &config.processor,
                storage.compression_level,
            ))
            .await?,
        );
        let renderer = Arc::new(Renderer::new(
            RenderOptions::from(&config.render),
            cache.clone(),
            processor.clone(),
        ));
        let ingest = Arc::new(ChunkIngest::new(columns.clone()));

        log(
            format!(
                "Pipeline opened at {} ({} stored chunks)",
                storage.data_dir.display(),
                store.len().await
            ),
            LogSeverity::Info,
        );

        Ok(Self {
            config,
            store,
            cache,
            columns,
            processor,
            renderer,
            ingest,
        })
    }

    pub async fn start(&self) {
        self.processor.start().await;
        self.renderer.start_background_loader().await;
    }

    /// Stops generation and the loader, then writes the store index.
    pub async fn shutdown(&self) {
        self.processor.stop().await;
        self.renderer.stop_background_loader().await;
        if let Err(e) = self.store.flush().await {
            log(format!("Failed to flush chunk index: {}", e), LogSeverity::Error);
        }
        log("Pipeline shut down".to_owned(), LogSeverity::Info);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<RegionStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn columns(&self) -> &Arc<ColumnStore> {
        &self.columns
    }

    pub fn processor(&self) -> &Arc<ChunkProcessor> {
        &self.processor
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn ingest(&self) -> &Arc<ChunkIngest> {
        &self.ingest
    }
}
