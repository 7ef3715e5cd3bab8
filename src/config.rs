use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cache_dir: PathBuf,
    pub font_dir: PathBuf,
    pub font_size_unit: FontSizeUnit,
    pub fetch_timeout: Duration,
    pub max_raster_bytes: usize,
    pub max_decoded_raster_pixels: u64,
    pub image_cache_ttl: Duration,
    pub raw_cache_ttl: Duration,
    pub cache_evict_interval: Duration,
    pub max_concurrent_preloads: usize,
    pub max_concurrent_renders: usize,
    pub max_batch_users: usize,
    pub max_in_flight_requests: usize,
    pub max_body_bytes: usize,
}

/// Whether `style.fontSize` arrives in CSS pixels (converted by 72/DPI) or
/// already in points. The template producer's contract is still unpinned, so
/// this stays a runtime toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontSizeUnit {
    Px,
    Pt,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 3000);
        let cache_dir = PathBuf::from(
            env::var("CACHE_DIR").unwrap_or_else(|_| "/tmp/badge-cache".to_string()),
        );
        let font_dir = PathBuf::from(env::var("FONT_DIR").unwrap_or_else(|_| "fonts".to_string()));
        let font_size_unit = parse_font_size_unit("FONT_SIZE_UNIT")?;

        let fetch_timeout = Duration::from_secs(parse_u64("FETCH_TIMEOUT_SECONDS", 5));
        let max_raster_bytes = parse_usize("MAX_RASTER_BYTES", 20 * 1024 * 1024);
        let max_decoded_raster_pixels = parse_u64("MAX_DECODED_RASTER_PIXELS", 100_000_000);

        let image_cache_ttl = Duration::from_secs(parse_u64("IMAGE_CACHE_TTL_SECONDS", 3600));
        let raw_cache_ttl = Duration::from_secs(parse_u64("RAW_CACHE_TTL_SECONDS", 86_400));
        let cache_evict_interval =
            Duration::from_secs(parse_u64("CACHE_EVICT_INTERVAL_SECONDS", 3600));

        let max_concurrent_preloads = parse_usize("MAX_CONCURRENT_PRELOADS", 50);
        let max_concurrent_renders = parse_usize("MAX_CONCURRENT_RENDERS", 50);
        let max_batch_users = parse_usize("MAX_BATCH_USERS", 500);
        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 0);
        let max_body_bytes = parse_usize("MAX_BODY_BYTES", 50 * 1024 * 1024);

        if max_concurrent_preloads == 0 {
            return Err(anyhow!("MAX_CONCURRENT_PRELOADS must be at least 1"));
        }
        if max_concurrent_renders == 0 {
            return Err(anyhow!("MAX_CONCURRENT_RENDERS must be at least 1"));
        }
        if max_batch_users == 0 {
            return Err(anyhow!("MAX_BATCH_USERS must be at least 1"));
        }

        Ok(Self {
            host,
            port,
            cache_dir,
            font_dir,
            font_size_unit,
            fetch_timeout,
            max_raster_bytes,
            max_decoded_raster_pixels,
            image_cache_ttl,
            raw_cache_ttl,
            cache_evict_interval,
            max_concurrent_preloads,
            max_concurrent_renders,
            max_batch_users,
            max_in_flight_requests,
            max_body_bytes,
        })
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests(cache_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            cache_dir,
            font_dir: PathBuf::from("fonts"),
            font_size_unit: FontSizeUnit::Px,
            fetch_timeout: Duration::from_secs(1),
            max_raster_bytes: 8 * 1024 * 1024,
            max_decoded_raster_pixels: 50_000_000,
            image_cache_ttl: Duration::from_secs(3600),
            raw_cache_ttl: Duration::from_secs(3600),
            cache_evict_interval: Duration::from_secs(0),
            max_concurrent_preloads: 4,
            max_concurrent_renders: 4,
            max_batch_users: 500,
            max_in_flight_requests: 0,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_font_size_unit(key: &str) -> Result<FontSizeUnit> {
    let value = env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase());
    match value.as_deref() {
        None | Some("") | Some("px") => Ok(FontSizeUnit::Px),
        Some("pt") => Ok(FontSizeUnit::Pt),
        Some(other) => Err(anyhow!("invalid {key} value: {other} (expected px or pt)")),
    }
}
