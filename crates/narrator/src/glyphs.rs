use std::collections::HashMap;
use std::path::Path;
use anyhow::{anyhow, Context, Result};
use fontdue::{Font, FontSettings};
use log::{debug, warn};

/// Share of the font size used for glyphs missing from the table
pub const FALLBACK_WIDTH_RATIO: f64 = 0.6;

/// Rendered pixel width per character for one font at one size
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphWidths {
    widths: HashMap<char, f64>,
    fallback: f64,
}

impl GlyphWidths {
    /// Build a table from known widths; missing characters use `FALLBACK_WIDTH_RATIO * font_px`
    pub fn from_map(widths: HashMap<char, f64>, font_px: f64) -> Self {
        let widths = widths
            .into_iter()
            .flat_map(|(c, w)| c.to_uppercase().map(move |u| (u, w)))
            .collect();
        Self { widths, fallback: font_px * FALLBACK_WIDTH_RATIO }
    }

    /// Measure printable ASCII in the font at `font_path`
    ///
    /// An unreadable font degrades to the fallback width for every glyph.
    pub fn measure(font_path: &Path, font_px: f64) -> Self {
        match Self::try_measure(font_path, font_px) {
            Ok(table) => table,
            Err(e) => {
                warn!("Using fallback glyph widths for {}: {:#}", font_path.display(), e);
                Self::from_map(HashMap::new(), font_px)
            }
        }
    }

    fn try_measure(font_path: &Path, font_px: f64) -> Result<Self> {
        let bytes = std::fs::read(font_path)
            .with_context(|| format!("Failed to read font: {}", font_path.display()))?;
        let font = Font::from_bytes(bytes, FontSettings::default())
            .map_err(|e| anyhow!("Failed to parse font {}: {}", font_path.display(), e))?;

        let mut widths = HashMap::new();
        for code in 32u8..=126 {
            let ch = (code as char).to_ascii_uppercase();
            let metrics = font.metrics(ch, font_px as f32);
            widths.insert(ch, metrics.advance_width as f64);
        }
        debug!("Measured {} glyphs from {} at {}px", widths.len(), font_path.display(), font_px);
        Ok(Self::from_map(widths, font_px))
    }

    /// Width of one character, looked up case-insensitively
    pub fn char_width(&self, ch: char) -> f64 {
        let upper = ch.to_uppercase().next().unwrap_or(ch);
        self.widths.get(&upper).copied().unwrap_or(self.fallback)
    }

    /// Sum of glyph widths of `text`
    pub fn text_width(&self, text: &str) -> f64 {
        text.chars().map(|c| self.char_width(c)).sum()
    }

    pub fn space_width(&self) -> f64 {
        self.char_width(' ')
    }
}
