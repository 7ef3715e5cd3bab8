use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Cache key for one processed image: the URL hash plus the placed size and
/// DPI, so the same URL at a different size is a distinct entry.
pub fn image_data_key(url: &str, width_mm: f64, height_mm: f64, dpi: u32) -> String {
    format!(
        "img_data:{:x}_{:.1}_{:.1}_{}",
        md5::compute(url.as_bytes()),
        width_mm,
        height_mm,
        dpi
    )
}

struct Entry {
    bytes: Bytes,
    inserted: Instant,
}

/// Process-wide map from cache key to processed PNG bytes. Entries are
/// immutable after insertion; concurrent readers share the `Bytes` handle.
/// A missed key may be filled by several callers at once (last writer wins).
#[derive(Clone)]
pub struct ImageDataCache {
    entries: Arc<DashMap<String, Entry>>,
    ttl: Duration,
}

impl ImageDataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let hit = self.entries.get(key)?;
        if hit.inserted.elapsed() > self.ttl {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.bytes.clone())
    }

    pub fn put(&self, key: String, bytes: Bytes) {
        self.entries.insert(
            key,
            Entry {
                bytes,
                inserted: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn sweep_expired(&self) {
        self.entries
            .retain(|_, entry| entry.inserted.elapsed() <= self.ttl);
    }
}

/// On-disk scratch for raw downloaded bytes, keyed by md5(url) under a
/// two-hex-char prefix directory. Entries expire by mtime.
#[derive(Clone)]
pub struct DiskCache {
    raw_dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(cache_dir: &Path, ttl: Duration) -> Result<Self> {
        let raw_dir = cache_dir.join("raw");
        std::fs::create_dir_all(&raw_dir)?;
        Ok(Self { raw_dir, ttl })
    }

    pub fn raw_path(&self, url: &str) -> PathBuf {
        let key = format!("{:x}", md5::compute(url.as_bytes()));
        self.raw_dir.join(&key[0..2]).join(key)
    }

    pub async fn load(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if let Ok(modified) = metadata.modified() {
            if is_expired(modified, self.ttl) {
                let _ = tokio::fs::remove_file(path).await;
                return Ok(None);
            }
        }
        Ok(Some(tokio::fs::read(path).await?))
    }

    /// Atomic write: temp file in the target directory, then rename.
    pub async fn store(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("cache");
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let temp_path = parent.join(format!(".{file_name}.tmp-{nonce}"));
        if let Err(err) = tokio::fs::write(&temp_path, bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        if self.raw_dir.exists() {
            tokio::fs::remove_dir_all(&self.raw_dir).await?;
        }
        tokio::fs::create_dir_all(&self.raw_dir).await?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        self.raw_dir.parent().unwrap_or(&self.raw_dir)
    }

    async fn evict_expired(&self) -> Result<usize> {
        let dir = self.raw_dir.clone();
        let ttl = self.ttl;
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut removed = 0usize;
            for entry in walk_dir(&dir)? {
                let metadata = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if let Ok(modified) = metadata.modified() {
                    if is_expired(modified, ttl) && std::fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                    }
                }
            }
            Ok(removed)
        })
        .await?
    }
}

/// Periodic sweep of both cache tiers.
pub async fn evict_loop(memory: ImageDataCache, disk: DiskCache, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        memory.sweep_expired();
        match disk.evict_expired().await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(removed, "disk cache eviction pass");
            }
            Ok(_) => {}
            Err(err) => warn!(error = ?err, "disk cache eviction error"),
        }
    }
}

fn is_expired(modified: SystemTime, ttl: Duration) -> bool {
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > ttl,
        Err(_) => false,
    }
}

fn walk_dir(dir: &Path) -> Result<Vec<std::fs::DirEntry>> {
    let mut entries = Vec::new();
    if !dir.exists() {
        return Ok(entries);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_format_is_deterministic() {
        let a = image_data_key("https://cdn.example/bg.png", 210.0, 297.0, 300);
        let b = image_data_key("https://cdn.example/bg.png", 210.0, 297.0, 300);
        assert_eq!(a, b);
        assert!(a.starts_with("img_data:"));
        assert!(a.ends_with("_210.0_297.0_300"));
    }

    #[test]
    fn key_changes_with_any_field() {
        let base = image_data_key("https://cdn.example/bg.png", 210.0, 297.0, 300);
        assert_ne!(base, image_data_key("https://cdn.example/fg.png", 210.0, 297.0, 300));
        assert_ne!(base, image_data_key("https://cdn.example/bg.png", 211.0, 297.0, 300));
        assert_ne!(base, image_data_key("https://cdn.example/bg.png", 210.0, 296.0, 300));
        assert_ne!(base, image_data_key("https://cdn.example/bg.png", 210.0, 297.0, 150));
    }

    #[test]
    fn memory_cache_round_trip() {
        let cache = ImageDataCache::new(Duration::from_secs(60));
        let key = image_data_key("https://x/a.png", 10.0, 10.0, 300);
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), Bytes::from_static(b"png-bytes"));
        assert_eq!(cache.get(&key).unwrap().as_ref(), b"png-bytes");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn memory_cache_expires() {
        let cache = ImageDataCache::new(Duration::from_secs(0));
        cache.put("k".to_string(), Bytes::from_static(b"v"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn concurrent_writers_leave_one_entry() {
        let cache = ImageDataCache::new(Duration::from_secs(60));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache.put("shared".to_string(), Bytes::from(vec![i as u8; 4]));
                    cache.get("shared")
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_some());
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn disk_cache_store_and_load() {
        let dir = tempdir().unwrap();
        let disk = DiskCache::new(dir.path(), Duration::from_secs(60)).unwrap();
        let path = disk.raw_path("https://cdn.example/a.png");
        assert!(disk.load(&path).await.unwrap().is_none());
        disk.store(&path, b"raw-bytes").await.unwrap();
        assert_eq!(disk.load(&path).await.unwrap().unwrap(), b"raw-bytes");
        disk.clear().await.unwrap();
        assert!(disk.load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disk_cache_paths_are_prefixed() {
        let dir = tempdir().unwrap();
        let disk = DiskCache::new(dir.path(), Duration::from_secs(60)).unwrap();
        let path = disk.raw_path("https://cdn.example/a.png");
        let prefix = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(prefix.len(), 2);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(prefix));
    }
}
