use crate::assets::AssetFetcher;
use crate::cache::{DiskCache, ImageDataCache};
use crate::config::Config;
use crate::preload::Preloader;
use crate::raster::RasterProcessor;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: ImageDataCache,
    pub disk: DiskCache,
    pub fetcher: AssetFetcher,
    pub preloader: Preloader,
    pub render_semaphore: Arc<Semaphore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let cache = ImageDataCache::new(config.image_cache_ttl);
        let disk = DiskCache::new(&config.cache_dir, config.raw_cache_ttl)?;
        let fetcher = AssetFetcher::new(&config, disk.clone())?;
        let processor = RasterProcessor::new(config.max_decoded_raster_pixels);
        let preloader = Preloader::new(
            fetcher.clone(),
            processor,
            cache.clone(),
            config.max_concurrent_preloads,
        );
        let render_semaphore = Arc::new(Semaphore::new(config.max_concurrent_renders));
        Ok(Self {
            config: Arc::new(config),
            cache,
            disk,
            fetcher,
            preloader,
            render_semaphore,
            started_at: Instant::now(),
        })
    }
}
