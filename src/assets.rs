use crate::cache::DiskCache;
use crate::config::Config;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use reqwest::{header, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AssetFetchError {
    #[error("invalid asset url")]
    InvalidUrl,
    #[error("asset too large")]
    TooLarge,
    #[error("asset fetch failed from {url}: {status}")]
    UpstreamStatus { status: StatusCode, url: String },
    #[error("asset fetch failed from {url}")]
    Upstream { url: String },
}

/// Outbound image fetcher. One shared client with a keep-alive pool;
/// individual requests are bounded by the configured hard timeout. No
/// retries here: re-issue is the caller's policy.
#[derive(Clone)]
pub struct AssetFetcher {
    client: reqwest::Client,
    disk: DiskCache,
    max_raster_bytes: usize,
}

impl AssetFetcher {
    pub fn new(config: &Config, disk: DiskCache) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .gzip(true)
            .deflate(true)
            .user_agent(concat!("badge-renderer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build reqwest client")?;
        Ok(Self {
            client,
            disk,
            max_raster_bytes: config.max_raster_bytes,
        })
    }

    /// Fetch raw bytes for a URL, consulting the disk mirror first and
    /// updating it after a successful download.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, AssetFetchError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AssetFetchError::InvalidUrl);
        }
        let cache_path = self.disk.raw_path(url);
        match self.disk.load(&cache_path).await {
            Ok(Some(bytes)) => {
                debug!(url = %url, size = bytes.len(), "raw asset disk hit");
                return Ok(Bytes::from(bytes));
            }
            Ok(None) => {}
            Err(err) => warn!(error = ?err, url = %url, "raw asset disk read failed"),
        }
        let bytes = self.fetch_http(url).await?;
        if let Err(err) = self.disk.store(&cache_path, &bytes).await {
            warn!(error = ?err, url = %url, "raw asset disk write failed");
        }
        Ok(bytes)
    }

    async fn fetch_http(&self, url: &str) -> Result<Bytes, AssetFetchError> {
        let mut response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|_| AssetFetchError::Upstream {
                    url: url.to_string(),
                })?;
        if !response.status().is_success() {
            return Err(AssetFetchError::UpstreamStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }
        if let Some(length) = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
        {
            if length > self.max_raster_bytes as u64 {
                return Err(AssetFetchError::TooLarge);
            }
        }
        let mut buffer = BytesMut::with_capacity(std::cmp::min(self.max_raster_bytes, 64 * 1024));
        let mut total = 0usize;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    return Err(AssetFetchError::Upstream {
                        url: url.to_string(),
                    })
                }
            };
            total = total.saturating_add(chunk.len());
            if total > self.max_raster_bytes {
                return Err(AssetFetchError::TooLarge);
            }
            buffer.extend_from_slice(&chunk);
        }
        debug!(url = %url, size = total, "fetched asset");
        Ok(buffer.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fetcher(dir: &std::path::Path) -> AssetFetcher {
        let config = Config::for_tests(dir.to_path_buf());
        let disk = DiskCache::new(dir, Duration::from_secs(60)).unwrap();
        AssetFetcher::new(&config, disk).unwrap()
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let dir = tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        assert!(matches!(
            fetcher.fetch("ftp://example.com/a.png").await,
            Err(AssetFetchError::InvalidUrl)
        ));
        assert!(matches!(
            fetcher.fetch("asset_0").await,
            Err(AssetFetchError::InvalidUrl)
        ));
    }

    #[tokio::test]
    async fn disk_mirror_short_circuits_network() {
        let dir = tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        // Pre-seed the mirror: the URL's host does not resolve, so a hit can
        // only come from disk.
        let url = "https://cdn.invalid.test/logo.png";
        let path = fetcher.disk.raw_path(url);
        fetcher.disk.store(&path, b"seeded-bytes").await.unwrap();
        let bytes = fetcher.fetch(url).await.unwrap();
        assert_eq!(bytes.as_ref(), b"seeded-bytes");
    }

    #[tokio::test]
    async fn unresolvable_host_is_upstream_error() {
        let dir = tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        let err = fetcher
            .fetch("https://does-not-resolve.invalid/x.png")
            .await
            .unwrap_err();
        assert!(matches!(err, AssetFetchError::Upstream { .. }));
    }
}
