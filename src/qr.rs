use crate::models::{mm_to_px, User};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Luma};
use qrcode::{EcLevel, QrCode};
use std::io::Cursor;
use thiserror::Error;

const MIN_QR_PX: u32 = 100;
const MAX_QR_PX: u32 = 1024;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("QR code content is empty")]
    EmptyContent,
    #[error("failed to build QR code: {0}")]
    Build(String),
    #[error("failed to encode QR png")]
    PngEncode,
}

/// Pick the string a QR layer encodes: the resolved content, unless it is
/// empty or still carries unresolved tokens, then the user's identifier,
/// then the user id.
pub fn qr_content<'a>(resolved: &'a str, user: &'a User) -> Result<&'a str, QrError> {
    let mut content = resolved;
    if content.is_empty() || content.contains("{{") {
        content = &user.identifier;
    }
    if content.is_empty() {
        content = &user.id;
    }
    if content.is_empty() {
        return Err(QrError::EmptyContent);
    }
    Ok(content)
}

/// Pixel size for a QR layer: the larger mm dimension at the template DPI,
/// clamped to keep scan quality without runaway rasters.
pub fn qr_pixel_size(width_mm: f64, height_mm: f64, dpi: u32) -> u32 {
    mm_to_px(width_mm.max(height_mm), dpi).clamp(MIN_QR_PX, MAX_QR_PX)
}

/// Synthesize a QR PNG entirely in memory at the requested pixel size.
pub fn generate(content: &str, px_size: u32) -> Result<Vec<u8>, QrError> {
    let code = QrCode::with_error_correction_level(content.as_bytes(), EcLevel::M)
        .map_err(|err| QrError::Build(err.to_string()))?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(px_size, px_size)
        .build();
    let mut png = Vec::new();
    let encoder = PngEncoder::new(Cursor::new(&mut png));
    encoder
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::L8,
        )
        .map_err(|_| QrError::PngEncode)?;
    Ok(png)
}
