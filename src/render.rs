use crate::config::FontSizeUnit;
use crate::fonts::{FontBook, FontVariant, PT_TO_MM};
use crate::models::{Layer, Template, User};
use crate::placeholder;
use crate::qr;
use crate::{flex, flex::FlexLayout};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use printpdf::path::{PaintMode, WindingOrder};
use printpdf::{
    ColorBits, ColorSpace, Image, ImageTransform, ImageXObject, Mm, PdfDocument,
    PdfDocumentReference, PdfLayerReference, Point, Polygon, Px,
};
use std::collections::HashMap;
use std::io::{BufWriter, Cursor};
use std::path::Path;
use tracing::warn;

const MIN_FONT_PT: f64 = 4.0;
const MAX_FONT_PT: f64 = 72.0;
/// Text is considered to fit a box when it stays inside 95% of the width.
const FIT_FACTOR: f64 = 0.95;
/// mm → pt for the height-derived auto-size ceiling.
const MM_TO_PT: f64 = 2.83;

/// A finished badge. Layer-scoped failures never stop emission; they are
/// collected so batch callers can flag the affected user.
pub struct RenderedBadge {
    pub bytes: Vec<u8>,
    pub layer_errors: Vec<String>,
}

/// Composes one badge: a single fixed-size page, layers drawn in ascending
/// z-order, images taken from the preloaded per-request map. One broken
/// layer is logged and skipped; only PDF emission itself is fatal.
pub struct Composer<'a> {
    template: &'a Template,
    user: &'a User,
    images: &'a HashMap<String, Bytes>,
    doc: PdfDocumentReference,
    page: PdfLayerReference,
    fonts: FontBook,
    paper_width: f64,
    paper_height: f64,
    dpi: u32,
    font_size_unit: FontSizeUnit,
    decoded: HashMap<String, DecodedImage>,
    layer_errors: Vec<String>,
}

struct DecodedImage {
    px_width: u32,
    px_height: u32,
    rgb: Vec<u8>,
}

impl<'a> Composer<'a> {
    pub fn new(
        template: &'a Template,
        user: &'a User,
        images: &'a HashMap<String, Bytes>,
        font_dir: &Path,
        font_size_unit: FontSizeUnit,
    ) -> Result<Self> {
        let (paper_width, paper_height) = template.paper_size();
        let (doc, page_index, layer_index) = PdfDocument::new(
            "Badge",
            Mm(paper_width as f32),
            Mm(paper_height as f32),
            "Layer 1",
        );
        let page = doc.get_page(page_index).get_layer(layer_index);
        let fonts = FontBook::load(&doc, font_dir)?;
        Ok(Self {
            template,
            user,
            images,
            doc,
            page,
            fonts,
            paper_width,
            paper_height,
            dpi: template.dpi(),
            font_size_unit,
            decoded: HashMap::new(),
            layer_errors: Vec::new(),
        })
    }

    pub fn render(mut self) -> Result<RenderedBadge> {
        let mut layers: Vec<&'a Layer> = self.template.design.layers.iter().collect();
        layers.sort_by_key(|layer| layer.z_index);
        for layer in layers {
            if !layer.visible {
                continue;
            }
            if let Err(err) = self.render_layer(layer, 0.0, 0.0) {
                warn!(
                    layer = %layer.id,
                    kind = %layer.kind,
                    error = %err,
                    "layer render failed, continuing"
                );
                self.layer_errors
                    .push(format!("layer {}: {err}", layer.id));
            }
        }
        let mut bytes = Vec::new();
        {
            let mut writer = BufWriter::new(Cursor::new(&mut bytes));
            self.doc
                .save(&mut writer)
                .map_err(|err| anyhow!("pdf emission failed: {err}"))?;
        }
        Ok(RenderedBadge {
            bytes,
            layer_errors: self.layer_errors,
        })
    }

    fn render_layer(&mut self, layer: &Layer, parent_x: f64, parent_y: f64) -> Result<()> {
        let x = parent_x + layer.position.x;
        let y = parent_y + layer.position.y;
        match layer.kind.as_str() {
            "text" => self.render_text(layer, x, y),
            "qrcode" => self.render_qrcode(layer, x, y),
            "image" => self.render_image(layer, x, y),
            "container" => self.render_container(layer, x, y),
            "shape" => self.render_shape(layer, x, y),
            _ => Ok(()),
        }
    }

    fn render_text(&mut self, layer: &Layer, x: f64, y: f64) -> Result<()> {
        let text = placeholder::resolve(&layer.content, self.user);
        if text.trim().is_empty() {
            return Ok(());
        }
        let variant = FontVariant::from_weight(&layer.style.font_weight);
        let mut size = convert_font_size(layer.style.font_size, self.dpi, self.font_size_unit);
        if layer.auto_font_size {
            size = self.auto_font_size(&text, layer.size.width, layer.size.height, size, variant);
        }
        let (r, g, b) = hex_to_rgb(&layer.style.color);
        self.page.set_fill_color(printpdf::Color::Rgb(printpdf::Rgb::new(r, g, b, None)));
        let align = Alignment::from_style(&layer.style.text_align);
        let width = layer.size.width;
        let height = layer.size.height;

        if text.contains('\n') {
            let lines: Vec<&str> = text.split('\n').collect();
            let line_height = (size * 1.2).min(height / lines.len() as f64);
            let mut row = 0usize;
            for line in &lines {
                if line.trim().is_empty() {
                    row += 1;
                    continue;
                }
                let line_top = y + row as f64 * line_height;
                if self.fonts.text_width_mm(line, size, variant) > width * FIT_FACTOR {
                    for wrapped in self.wrap_text(line, width * FIT_FACTOR, size, variant) {
                        let top = y + row as f64 * line_height;
                        self.draw_text_cell(&wrapped, x, top, width, line_height, size, align, variant);
                        row += 1;
                    }
                } else {
                    self.draw_text_cell(line, x, line_top, width, line_height, size, align, variant);
                    row += 1;
                }
            }
        } else if self.fonts.text_width_mm(&text, size, variant) > width * FIT_FACTOR {
            let line_height = (size * 1.2).min(height);
            for (row, wrapped) in self
                .wrap_text(&text, width * FIT_FACTOR, size, variant)
                .iter()
                .enumerate()
            {
                let top = y + row as f64 * line_height;
                self.draw_text_cell(wrapped, x, top, width, line_height, size, align, variant);
            }
        } else {
            self.draw_text_cell(&text, x, y, width, height, size, align, variant);
        }
        Ok(())
    }

    /// Largest size in [4, min(height·2.83, base, 72)] whose measured width
    /// fits the box, found by binary search to 0.1 pt.
    fn auto_font_size(
        &self,
        text: &str,
        width_mm: f64,
        height_mm: f64,
        base_pt: f64,
        variant: FontVariant,
    ) -> f64 {
        let mut high = height_mm * MM_TO_PT;
        if base_pt > 0.0 && base_pt < high {
            high = base_pt;
        }
        high = high.min(MAX_FONT_PT);
        let mut low = MIN_FONT_PT;
        while high - low > 0.1 {
            let probe = (low + high) / 2.0;
            if self.fonts.text_width_mm(text, probe, variant) <= width_mm * FIT_FACTOR {
                low = probe;
            } else {
                high = probe;
            }
        }
        low
    }

    /// Greedy word wrap against a width limit in mm. A single word wider
    /// than the limit becomes its own line.
    fn wrap_text(
        &self,
        text: &str,
        limit_mm: f64,
        size_pt: f64,
        variant: FontVariant,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        let mut current = String::new();
        for word in text.split_whitespace() {
            let candidate = if current.is_empty() {
                word.to_string()
            } else {
                format!("{current} {word}")
            };
            if self.fonts.text_width_mm(&candidate, size_pt, variant) <= limit_mm
                || current.is_empty()
            {
                current = candidate;
            } else {
                lines.push(std::mem::take(&mut current));
                current = word.to_string();
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
        lines
    }

    /// Draw one line inside a cell, horizontally aligned and vertically
    /// centered. Coordinates arrive top-left in mm; printpdf wants the
    /// baseline from the bottom-left corner of the page.
    #[allow(clippy::too_many_arguments)]
    fn draw_text_cell(
        &self,
        line: &str,
        x: f64,
        y_top: f64,
        cell_width: f64,
        cell_height: f64,
        size_pt: f64,
        align: Alignment,
        variant: FontVariant,
    ) {
        let line_width = self.fonts.text_width_mm(line, size_pt, variant);
        let draw_x = match align {
            Alignment::Left => x,
            Alignment::Center => x + (cell_width - line_width) / 2.0,
            Alignment::Right => x + cell_width - line_width,
        };
        // Baseline sits below the cell's vertical center by roughly half the
        // cap height.
        let baseline_from_top = y_top + cell_height / 2.0 + 0.35 * size_pt * PT_TO_MM;
        let pdf_y = self.paper_height - baseline_from_top;
        self.page.use_text(
            line,
            size_pt as f32,
            Mm(draw_x as f32),
            Mm(pdf_y as f32),
            self.fonts.font(variant),
        );
    }

    fn render_qrcode(&mut self, layer: &Layer, x: f64, y: f64) -> Result<()> {
        if layer.style.opacity == 0.0 {
            return Ok(());
        }
        let resolved = placeholder::resolve(&layer.content, self.user);
        let content = qr::qr_content(&resolved, self.user)?;
        let px = qr::qr_pixel_size(layer.size.width, layer.size.height, self.dpi);
        let name = format!("qr_{}_{:x}", layer.id, md5::compute(content.as_bytes()));
        if !self.decoded.contains_key(&name) {
            let png = qr::generate(content, px)?;
            let decoded = decode_png(&png)
                .with_context(|| format!("register qr image for layer {}", layer.id))?;
            self.decoded.insert(name.clone(), decoded);
        }
        self.place_image(&name, x, y, layer.size.width, layer.size.height);
        Ok(())
    }

    fn render_image(&mut self, layer: &Layer, x: f64, y: f64) -> Result<()> {
        let Some(url) = resolve_image_url(layer, self.template, self.user) else {
            return Ok(());
        };
        if layer.style.opacity == 0.0 {
            return Ok(());
        }
        // Rotation is accepted in the style block but not applied.
        let name = format!("img_{:x}", md5::compute(url.as_bytes()));
        if !self.decoded.contains_key(&name) {
            let Some(bytes) = self.images.get(url.as_str()) else {
                return Err(anyhow!("image bytes not preloaded for {url}"));
            };
            let decoded = decode_png(bytes)
                .with_context(|| format!("register image data for layer {}", layer.id))?;
            self.decoded.insert(name.clone(), decoded);
        }
        self.place_image(&name, x, y, layer.size.width, layer.size.height);
        Ok(())
    }

    fn render_container(&mut self, layer: &Layer, x: f64, y: f64) -> Result<()> {
        if layer.children.is_empty() {
            return Ok(());
        }
        let layout = layer
            .container_layout
            .as_ref()
            .map(FlexLayout::from_descriptor)
            .unwrap_or_else(FlexLayout::stacked);
        let offsets = flex::child_positions(layer.size, &layer.children, layout);
        for (child, offset) in layer.children.iter().zip(offsets) {
            if !child.visible {
                continue;
            }
            if let Err(err) = self.render_layer(child, x + offset.x, y + offset.y) {
                warn!(
                    layer = %child.id,
                    kind = %child.kind,
                    error = %err,
                    "child layer render failed, continuing"
                );
            }
        }
        Ok(())
    }

    fn render_shape(&mut self, layer: &Layer, x: f64, y: f64) -> Result<()> {
        let color = layer.style.background_color.as_str();
        if color.is_empty() || color == "transparent" {
            return Ok(());
        }
        let (r, g, b) = hex_to_rgb(color);
        self.page.set_fill_color(printpdf::Color::Rgb(printpdf::Rgb::new(r, g, b, None)));
        let bottom = self.paper_height - y - layer.size.height;
        self.fill_rect(x, bottom, layer.size.width, layer.size.height);
        Ok(())
    }

    fn fill_rect(&self, x: f64, y: f64, width: f64, height: f64) {
        let points = vec![
            (Point::new(Mm(x as f32), Mm(y as f32)), false),
            (Point::new(Mm((x + width) as f32), Mm(y as f32)), false),
            (
                Point::new(Mm((x + width) as f32), Mm((y + height) as f32)),
                false,
            ),
            (Point::new(Mm(x as f32), Mm((y + height) as f32)), false),
        ];
        self.page.add_polygon(Polygon {
            rings: vec![points],
            mode: PaintMode::Fill,
            winding_order: WindingOrder::NonZero,
        });
    }

    /// Place a previously decoded image at a top-left mm position with an
    /// exact placed size, regardless of its pixel dimensions.
    fn place_image(&self, name: &str, x: f64, y: f64, width_mm: f64, height_mm: f64) {
        let Some(decoded) = self.decoded.get(name) else {
            return;
        };
        let xobject = ImageXObject {
            width: Px(decoded.px_width as usize),
            height: Px(decoded.px_height as usize),
            color_space: ColorSpace::Rgb,
            bits_per_component: ColorBits::Bit8,
            interpolate: true,
            image_data: decoded.rgb.clone(),
            image_filter: None,
            clipping_bbox: None,
            smask: None,
        };
        let dpi = self.dpi as f64;
        let natural_width_mm = decoded.px_width as f64 * 25.4 / dpi;
        let natural_height_mm = decoded.px_height as f64 * 25.4 / dpi;
        let scale_x = if natural_width_mm > 0.0 {
            width_mm / natural_width_mm
        } else {
            1.0
        };
        let scale_y = if natural_height_mm > 0.0 {
            height_mm / natural_height_mm
        } else {
            1.0
        };
        let translate_y = self.paper_height - y - height_mm;
        Image::from(xobject).add_to_layer(
            self.page.clone(),
            ImageTransform {
                translate_x: Some(Mm(x as f32)),
                translate_y: Some(Mm(translate_y as f32)),
                scale_x: Some(scale_x as f32),
                scale_y: Some(scale_y as f32),
                dpi: Some(dpi as f32),
                ..Default::default()
            },
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alignment {
    Left,
    Center,
    Right,
}

impl Alignment {
    fn from_style(text_align: &str) -> Self {
        match text_align {
            "center" => Alignment::Center,
            "right" => Alignment::Right,
            _ => Alignment::Left,
        }
    }
}

/// Image layer URL resolution: asset reference, then data binding, then a
/// literal http(s) URL in the content.
pub fn resolve_image_url(layer: &Layer, template: &Template, user: &User) -> Option<String> {
    if layer.content.starts_with("asset_") {
        return template.asset_url(&layer.content).map(|url| url.to_string());
    }
    if !layer.data_binding.is_empty() {
        let field_id = layer
            .data_binding
            .strip_prefix("customFields.")
            .unwrap_or(&layer.data_binding);
        return user
            .field_value(field_id)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string());
    }
    if layer.content.starts_with("http://") || layer.content.starts_with("https://") {
        return Some(layer.content.clone());
    }
    None
}

/// `fontSize` interpretation: CSS pixels converted by 72/DPI, or points used
/// directly, both clamped to [4, 72].
pub fn convert_font_size(font_size: f64, dpi: u32, unit: FontSizeUnit) -> f64 {
    let size = match unit {
        FontSizeUnit::Px => font_size * 72.0 / dpi as f64,
        FontSizeUnit::Pt => font_size,
    };
    size.clamp(MIN_FONT_PT, MAX_FONT_PT)
}

/// `#RRGGBB` to unit-range RGB; short or malformed values fall back to black.
pub fn hex_to_rgb(hex: &str) -> (f32, f32, f32) {
    let stripped = hex.trim().trim_start_matches('#');
    if stripped.len() != 6 {
        return (0.0, 0.0, 0.0);
    }
    match hex::decode(stripped) {
        Ok(bytes) => (
            bytes[0] as f32 / 255.0,
            bytes[1] as f32 / 255.0,
            bytes[2] as f32 / 255.0,
        ),
        Err(_) => (0.0, 0.0, 0.0),
    }
}

fn decode_png(bytes: &[u8]) -> Result<DecodedImage> {
    let image = image::load_from_memory(bytes).context("decode processed png")?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    // The xobject is plain RGB; composite transparency against the white
    // badge stock instead of dropping alpha to black.
    let mut rgb = Vec::with_capacity((width as usize) * (height as usize) * 3);
    for pixel in rgba.pixels() {
        let [r, g, b, a] = pixel.0;
        if a == 255 {
            rgb.extend_from_slice(&[r, g, b]);
        } else {
            let alpha = a as f32 / 255.0;
            let blend = |c: u8| (c as f32 * alpha + 255.0 * (1.0 - alpha)) as u8;
            rgb.extend_from_slice(&[blend(r), blend(g), blend(b)]);
        }
    }
    Ok(DecodedImage {
        px_width: width,
        px_height: height,
        rgb,
    })
}
