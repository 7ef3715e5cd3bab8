use crate::assets::AssetFetcher;
use crate::cache::{image_data_key, ImageDataCache};
use crate::models::ImageRequest;
use crate::raster::RasterProcessor;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::warn;

/// Concurrent batch driver for the image pipeline: fan out fetch+process
/// over a bounded worker pool and return the per-URL processed bytes for
/// this request. Individual failures are swallowed; the result map simply
/// lacks that URL and the per-layer renderer degrades.
#[derive(Clone)]
pub struct Preloader {
    fetcher: AssetFetcher,
    processor: RasterProcessor,
    cache: ImageDataCache,
    permits: Arc<Semaphore>,
}

impl Preloader {
    pub fn new(
        fetcher: AssetFetcher,
        processor: RasterProcessor,
        cache: ImageDataCache,
        max_concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            processor,
            cache,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub async fn preload(&self, requests: Vec<ImageRequest>) -> HashMap<String, Bytes> {
        let requests = dedup(requests);
        let results = Arc::new(Mutex::new(HashMap::with_capacity(requests.len())));
        let mut workers = JoinSet::new();
        for request in requests {
            let preloader = self.clone();
            let results = results.clone();
            workers.spawn(async move {
                let _permit = match preloader.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                match preloader.load_one(&request).await {
                    Ok(bytes) => {
                        results.lock().await.insert(request.url.clone(), bytes);
                    }
                    Err(err) => {
                        warn!(url = %request.url, error = %err, "image preload failed");
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}
        Arc::try_unwrap(results)
            .map(|mutex| mutex.into_inner())
            .unwrap_or_default()
    }

    /// Cache-through load of one request: hit returns the cached PNG, miss
    /// runs fetch + process and fills the cache.
    pub async fn load_one(&self, request: &ImageRequest) -> anyhow::Result<Bytes> {
        let key = image_data_key(
            &request.url,
            request.width_mm,
            request.height_mm,
            request.dpi,
        );
        if let Some(bytes) = self.cache.get(&key) {
            return Ok(bytes);
        }
        let raw = self.fetcher.fetch(&request.url).await?;
        let (px_w, px_h) = request.pixel_size();
        let processor = self.processor.clone();
        let processed =
            tokio::task::spawn_blocking(move || processor.process(&raw, px_w, px_h)).await??;
        let bytes = Bytes::from(processed);
        self.cache.put(key, bytes.clone());
        Ok(bytes)
    }
}

/// Two requests are the same unit of work when URL, placed size and DPI all
/// match; the size tuple is part of the cache key.
fn dedup(requests: Vec<ImageRequest>) -> Vec<ImageRequest> {
    let mut seen = HashSet::new();
    requests
        .into_iter()
        .filter(|request| {
            seen.insert(image_data_key(
                &request.url,
                request.width_mm,
                request.height_mm,
                request.dpi,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use crate::config::Config;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::tempdir;

    fn request(url: &str, w: f64, h: f64) -> ImageRequest {
        ImageRequest {
            url: url.to_string(),
            width_mm: w,
            height_mm: h,
            dpi: 300,
        }
    }

    #[test]
    fn dedup_by_full_tuple() {
        let requests = vec![
            request("https://x/a.png", 10.0, 10.0),
            request("https://x/a.png", 10.0, 10.0),
            request("https://x/a.png", 20.0, 10.0),
            request("https://x/b.png", 10.0, 10.0),
        ];
        let deduped = dedup(requests);
        assert_eq!(deduped.len(), 3);
    }

    fn preloader(dir: &std::path::Path) -> (Preloader, ImageDataCache, DiskCache) {
        let config = Config::for_tests(dir.to_path_buf());
        let disk = DiskCache::new(dir, Duration::from_secs(60)).unwrap();
        let fetcher = AssetFetcher::new(&config, disk.clone()).unwrap();
        let processor = RasterProcessor::new(config.max_decoded_raster_pixels);
        let cache = ImageDataCache::new(config.image_cache_ttl);
        (
            Preloader::new(fetcher, processor, cache.clone(), config.max_concurrent_preloads),
            cache,
            disk,
        )
    }

    // Seed the fetcher's disk mirror; hosts are unresolvable so a preload
    // hit can only come from the seeded bytes.
    fn seed_png(disk: &DiskCache, url: &str, width: u32, height: u32) {
        let image = RgbaImage::from_pixel(width, height, Rgba([1, 2, 3, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let path = disk.raw_path(url);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn preload_fills_cache_and_result_map() {
        let dir = tempdir().unwrap();
        let (preloader, cache, disk) = preloader(dir.path());
        let url = "https://cdn.invalid.test/bg.png";
        seed_png(&disk, url, 200, 100);

        let results = preloader
            .preload(vec![request(url, 50.0, 25.0), request(url, 50.0, 25.0)])
            .await;
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(url));
        assert_eq!(cache.len(), 1);
        let key = image_data_key(url, 50.0, 25.0, 300);
        assert!(cache.get(&key).is_some());
    }

    #[tokio::test]
    async fn preload_is_idempotent() {
        let dir = tempdir().unwrap();
        let (preloader, cache, disk) = preloader(dir.path());
        let url = "https://cdn.invalid.test/logo.png";
        seed_png(&disk, url, 100, 100);

        let first = preloader.preload(vec![request(url, 30.0, 30.0)]).await;
        let second = preloader.preload(vec![request(url, 30.0, 30.0)]).await;
        assert_eq!(first[url], second[url]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failed_urls_are_omitted() {
        let dir = tempdir().unwrap();
        let (preloader, _cache, disk) = preloader(dir.path());
        let good = "https://cdn.invalid.test/ok.png";
        seed_png(&disk, good, 100, 100);

        let results = preloader
            .preload(vec![
                request(good, 30.0, 30.0),
                request("https://does-not-resolve.invalid/missing.png", 30.0, 30.0),
            ])
            .await;
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(good));
    }

    #[tokio::test]
    async fn many_requests_across_bounded_workers() {
        let dir = tempdir().unwrap();
        let (preloader, cache, disk) = preloader(dir.path());
        let mut requests = Vec::new();
        for index in 0..40 {
            let url = format!("https://cdn.invalid.test/{index}.png");
            seed_png(&disk, &url, 64, 64);
            requests.push(request(&url, 20.0, 20.0));
            // Duplicate every entry; dedup keeps the worker count at 40.
            requests.push(request(&url, 20.0, 20.0));
        }
        let results = preloader.preload(requests).await;
        assert_eq!(results.len(), 40);
        assert_eq!(cache.len(), 40);
    }
}
