use anyhow::{Context, Result};
use printpdf::{BuiltinFont, IndirectFontRef, PdfDocumentReference};
use rusttype::{Font, Scale};
use std::path::Path;
use tracing::{debug, warn};

pub const PT_TO_MM: f64 = 25.4 / 72.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontVariant {
    Regular,
    Bold,
}

impl FontVariant {
    /// "bold" or "700" select the bold face; anything else is regular.
    pub fn from_weight(weight: &str) -> Self {
        match weight {
            "bold" | "700" => FontVariant::Bold,
            _ => FontVariant::Regular,
        }
    }
}

/// The two faces a badge can use, each with a registered PDF font and a
/// measurement source. A TTF pair from `FONT_DIR` gives Unicode coverage;
/// otherwise the built-in Helvetica pair with AFM width tables fills in.
pub struct FontBook {
    regular: Face,
    bold: Face,
}

struct Face {
    font: IndirectFontRef,
    metrics: Metrics,
}

enum Metrics {
    Ttf(Font<'static>),
    Builtin { bold: bool },
}

impl FontBook {
    pub fn load(doc: &PdfDocumentReference, font_dir: &Path) -> Result<Self> {
        let regular = Self::load_face(doc, &font_dir.join("arial.ttf"), false)?;
        let bold = Self::load_face(doc, &font_dir.join("arialbd.ttf"), true)?;
        Ok(Self { regular, bold })
    }

    fn load_face(doc: &PdfDocumentReference, ttf_path: &Path, bold: bool) -> Result<Face> {
        if let Ok(bytes) = std::fs::read(ttf_path) {
            let parsed = Font::try_from_vec(bytes.clone());
            match parsed {
                Some(metrics_font) => {
                    let font = doc
                        .add_external_font(&bytes[..])
                        .with_context(|| format!("register font {}", ttf_path.display()))?;
                    debug!(path = %ttf_path.display(), "registered external font");
                    return Ok(Face {
                        font,
                        metrics: Metrics::Ttf(metrics_font),
                    });
                }
                None => {
                    warn!(path = %ttf_path.display(), "font file unparseable, using builtin");
                }
            }
        }
        let builtin = if bold {
            BuiltinFont::HelveticaBold
        } else {
            BuiltinFont::Helvetica
        };
        let font = doc
            .add_builtin_font(builtin)
            .context("register builtin font")?;
        Ok(Face {
            font,
            metrics: Metrics::Builtin { bold },
        })
    }

    pub fn font(&self, variant: FontVariant) -> &IndirectFontRef {
        match variant {
            FontVariant::Regular => &self.regular.font,
            FontVariant::Bold => &self.bold.font,
        }
    }

    /// Width of a single line at `size_pt`, in millimeters.
    pub fn text_width_mm(&self, text: &str, size_pt: f64, variant: FontVariant) -> f64 {
        let face = match variant {
            FontVariant::Regular => &self.regular,
            FontVariant::Bold => &self.bold,
        };
        match &face.metrics {
            Metrics::Ttf(font) => ttf_string_width_pt(font, text, size_pt) * PT_TO_MM,
            Metrics::Builtin { bold } => builtin_string_width_pt(text, size_pt, *bold) * PT_TO_MM,
        }
    }
}

fn ttf_string_width_pt(font: &Font<'_>, text: &str, size_pt: f64) -> f64 {
    let scale = Scale::uniform(size_pt as f32);
    text.chars()
        .map(|c| font.glyph(c).scaled(scale).h_metrics().advance_width as f64)
        .sum()
}

/// Helvetica string width in points via the Adobe AFM advance widths.
pub fn builtin_string_width_pt(text: &str, size_pt: f64, bold: bool) -> f64 {
    let units: u32 = text
        .chars()
        .map(|c| {
            if bold {
                helvetica_bold_width(c) as u32
            } else {
                helvetica_width(c) as u32
            }
        })
        .sum();
    units as f64 / 1000.0 * size_pt
}

// Advance widths in 1/1000 em for the built-in Helvetica face.
fn helvetica_width(c: char) -> u16 {
    match c {
        ' ' | '!' | ',' | '.' | '/' | ':' | ';' | '\\' | '[' | ']' => 278,
        '"' => 355,
        '\'' => 191,
        '(' | ')' | '-' | '`' => 333,
        '*' => 389,
        '+' | '<' | '=' | '>' | '~' | '±' | '×' | '÷' => 584,
        '0'..='9' | '#' | '$' | '?' | '_' | '€' | '£' | '¥' => 556,
        '%' => 889,
        '&' => 667,
        '@' => 1015,
        'A' | 'B' | 'E' | 'K' | 'P' | 'S' | 'V' | 'X' | 'Y' => 667,
        'C' | 'D' | 'H' | 'N' | 'R' | 'U' => 722,
        'F' | 'T' | 'Z' => 611,
        'G' | 'O' | 'Q' => 778,
        'I' => 278,
        'J' => 500,
        'L' => 556,
        'M' => 833,
        'W' => 944,
        '^' => 469,
        'a' | 'b' | 'd' | 'e' | 'g' | 'h' | 'n' | 'o' | 'p' | 'q' | 'u' => 556,
        'c' | 'k' | 's' | 'v' | 'x' | 'y' | 'z' => 500,
        'f' | 't' => 278,
        'i' | 'j' | 'l' => 222,
        'm' => 833,
        'r' => 333,
        'w' => 722,
        '{' | '}' => 334,
        '|' => 260,
        '–' => 556,
        '—' | '…' | '™' => 1000,
        '©' | '®' => 737,
        '°' => 400,
        _ => 556,
    }
}

fn helvetica_bold_width(c: char) -> u16 {
    match c {
        ' ' | ',' | '.' | '/' | '\\' => 278,
        '!' | '(' | ')' | '-' | ':' | ';' | '[' | ']' | '`' | 't' | 'f' => 333,
        '"' => 474,
        '\'' => 238,
        '*' => 389,
        '+' | '<' | '=' | '>' | '^' | '~' => 584,
        '0'..='9' | '#' | '$' | '_' => 556,
        '%' => 889,
        '&' => 722,
        '?' => 611,
        '@' => 975,
        'A' | 'B' | 'C' | 'D' | 'H' | 'K' | 'N' | 'R' | 'U' => 722,
        'E' | 'S' | 'V' | 'X' | 'Y' => 667,
        'F' | 'T' | 'Z' | 'L' => 611,
        'G' | 'O' | 'Q' => 778,
        'I' => 278,
        'J' => 556,
        'M' => 833,
        'W' => 944,
        'a' | 'c' | 'e' | 'k' | 's' | 'v' | 'x' | 'y' => 556,
        'b' | 'd' | 'g' | 'h' | 'n' | 'o' | 'p' | 'q' | 'u' => 611,
        'i' | 'j' | 'l' => 278,
        'm' => 889,
        'r' => 389,
        'w' => 778,
        'z' => 500,
        '{' | '}' => 389,
        '|' => 280,
        _ => 556,
    }
}
