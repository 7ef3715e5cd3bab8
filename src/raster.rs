use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder, ImageFormat, ImageReader, RgbaImage};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("raster exceeds max decoded pixels")]
    TooLarge,
}

/// Decodes, resizes and re-encodes one image to the 8-bit RGBA PNG form the
/// PDF writer accepts. CPU-bound; callers run it on the blocking pool.
#[derive(Clone)]
pub struct RasterProcessor {
    max_decoded_pixels: u64,
    pool: BufferPool,
}

impl RasterProcessor {
    pub fn new(max_decoded_pixels: u64) -> Self {
        Self {
            max_decoded_pixels,
            pool: BufferPool::new(),
        }
    }

    /// Decode `bytes`, resample to (`px_w`, `px_h`) unless the source is
    /// within 10% of target on both axes, normalize to RGBA8 and re-encode
    /// as PNG. The returned bytes are independent of the scratch pool.
    pub fn process(&self, bytes: &[u8], px_w: u32, px_h: u32) -> Result<Vec<u8>, RasterError> {
        let image = self.decode(bytes)?;
        let (src_w, src_h) = (image.width(), image.height());

        // Resize only when either axis is off by more than a tenth of the
        // target; print output tolerates the small mismatch and skipping the
        // resample saves most of the processing time.
        let dw = src_w.abs_diff(px_w);
        let dh = src_h.abs_diff(px_h);
        let image = if px_w > 0 && px_h > 0 && (dw > px_w / 10 || dh > px_h / 10) {
            image::imageops::resize(&image, px_w, px_h, FilterType::Nearest)
        } else {
            image
        };

        let mut scratch = self.pool.acquire((image.width() as usize) * (image.height() as usize) * 4);
        let encoder = PngEncoder::new(Cursor::new(&mut *scratch));
        encoder
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgba8,
            )
            .map_err(|err| RasterError::Encode(err.to_string()))?;
        Ok(scratch.to_vec())
    }

    /// Decode to RGBA8 without resizing. WebP is sniffed by magic and routed
    /// through an explicit WebP reader (covers VP8X extended files); other
    /// formats dispatch by their own magic.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbaImage, RasterError> {
        let reader = if is_webp(bytes) {
            let mut reader = ImageReader::with_format(Cursor::new(bytes), ImageFormat::WebP);
            reader.limits(self.limits());
            reader
        } else {
            let mut reader = ImageReader::new(Cursor::new(bytes))
                .with_guessed_format()
                .map_err(|err| RasterError::Decode(err.to_string()))?;
            reader.limits(self.limits());
            reader
        };
        let image = reader
            .decode()
            .map_err(|err| RasterError::Decode(err.to_string()))?;
        let pixels = (image.width() as u64).saturating_mul(image.height() as u64);
        if pixels > self.max_decoded_pixels {
            return Err(RasterError::TooLarge);
        }
        Ok(image.to_rgba8())
    }

    fn limits(&self) -> image::Limits {
        let max_dim = self.max_decoded_pixels.min(u32::MAX as u64) as u32;
        let mut limits = image::Limits::default();
        limits.max_image_width = Some(max_dim);
        limits.max_image_height = Some(max_dim);
        limits.max_alloc = Some(self.max_decoded_pixels.saturating_mul(4));
        limits
    }
}

/// `RIFF <size> WEBP` container magic.
pub fn is_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

/// Free list of encoder scratch buffers. Each buffer is owned by exactly one
/// task between `acquire` and drop; it comes back cleared.
#[derive(Clone)]
struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let mut buffer = self
            .free
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .pop()
            .unwrap_or_default();
        buffer.clear();
        if buffer.capacity() < min_capacity {
            buffer.reserve(min_capacity - buffer.capacity());
        }
        PooledBuffer {
            buffer,
            pool: self.free.clone(),
        }
    }
}

struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(buffer);
    }
}
