use std::path::PathBuf;
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::CaptionSettings;
use crate::filtergraph::{DrawText, Filter, FilterChain};
use crate::glyphs::GlyphWidths;
use crate::job::VideoType;
use crate::layout::CaptionLine;
use crate::text::display_word;

/// Vertical caption placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionPosition {
    Top,
    Bottom,
    Middle,
}

impl CaptionPosition {
    pub const ALL: [CaptionPosition; 3] = [CaptionPosition::Top, CaptionPosition::Bottom, CaptionPosition::Middle];

    pub fn from_setting(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "top" => Some(CaptionPosition::Top),
            "bottom" => Some(CaptionPosition::Bottom),
            "middle" | "center" => Some(CaptionPosition::Middle),
            _ => None,
        }
    }

    /// Parse `value`, picking a random position when it is not recognised
    pub fn resolve<R: Rng + ?Sized>(value: &str, rng: &mut R) -> Self {
        Self::from_setting(value).unwrap_or_else(|| {
            let picked = *Self::ALL.choose(rng).unwrap_or(&CaptionPosition::Middle);
            debug!("Caption position {:?} not recognised, picked {:?}", value, picked);
            picked
        })
    }

    /// drawtext `y` expression
    pub fn y_expr(&self, offset: u32) -> String {
        match self {
            CaptionPosition::Top => offset.to_string(),
            CaptionPosition::Bottom => format!("h-(text_h+{})", offset),
            CaptionPosition::Middle => "(h-text_h)/2".to_string(),
        }
    }
}

/// Caption styling resolved to pixels for one output frame
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionStyle {
    pub font_file: PathBuf,
    pub font_size: u32,
    pub position: CaptionPosition,
    pub offset: u32,
    pub text_color: String,
    pub border_color: String,
    pub border_width: u32,
    pub highlight_text_color: String,
    pub highlight_border_color: String,
    pub highlight_border_width: u32,
    /// Widest a caption line may be
    pub line_budget: f64,
    pub max_words_per_line: Option<usize>,
}

impl CaptionStyle {
    /// Resolve percentages against the frame and settle every random choice
    pub fn resolve<R: Rng + ?Sized>(
        settings: &CaptionSettings,
        video_type: VideoType,
        width: u32,
        height: u32,
        rng: &mut R,
    ) -> Self {
        let size_setting = match video_type {
            VideoType::Horizontal => settings.font_size,
            VideoType::Vertical => settings.vertical_font_size,
        };
        let font_size = size_setting.resolve(width as f64).floor().max(1.0);

        let highlight_border_color = if settings.highlight_border_color.eq_ignore_ascii_case("random") {
            settings
                .palette
                .choose(rng)
                .cloned()
                .unwrap_or_else(|| settings.border_color.clone())
        } else {
            settings.highlight_border_color.clone()
        };

        Self {
            font_file: settings.font_path.clone(),
            font_size: font_size as u32,
            position: CaptionPosition::resolve(&settings.position, rng),
            offset: settings.position_offset.resolve(height as f64).floor().max(0.0) as u32,
            text_color: settings.text_color.clone(),
            border_color: settings.border_color.clone(),
            border_width: settings.border_width.resolve(font_size).floor().max(0.0) as u32,
            highlight_text_color: settings.highlight_text_color.clone(),
            highlight_border_color,
            highlight_border_width: settings.highlight_border_width.resolve(font_size).floor().max(0.0) as u32,
            line_budget: width as f64 * settings.line_usage_percent / 100.0,
            max_words_per_line: settings.max_words_per_line,
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Two drawtext layers per word: a base layer visible for the whole line and a
/// highlight layer visible while the word is spoken
pub fn build_overlay_expression(
    lines: &[CaptionLine],
    video_width: u32,
    style: &CaptionStyle,
    glyphs: &GlyphWidths,
) -> FilterChain {
    let font_file = style.font_file.display().to_string();
    let y = style.position.y_expr(style.offset);
    let space = glyphs.space_width();
    let mut chain = FilterChain::new();

    for line in lines {
        let (line_start, line_end) = line.window();
        let shown: Vec<String> = line.words.iter().map(|w| display_word(&w.word)).collect();
        let widths: Vec<f64> = shown.iter().map(|w| glyphs.text_width(w)).collect();
        let phrase_width = widths.iter().sum::<f64>() + shown.len().saturating_sub(1) as f64 * space;
        let left = (video_width as f64 - phrase_width) / 2.0;

        let mut cursor = 0.0;
        for ((word, text), width) in line.words.iter().zip(&shown).zip(&widths) {
            let x = format!("{:.2}", round_to(left + cursor, 2));

            chain = chain.then(Filter::DrawText(DrawText {
                font_file: font_file.clone(),
                font_size: style.font_size,
                text: text.clone(),
                x: x.clone(),
                y: y.clone(),
                font_color: style.text_color.clone(),
                border_width: style.border_width,
                border_color: style.border_color.clone(),
                enable: Some((round_to(line_start, 1), round_to(line_end, 1))),
            }));
            chain = chain.then(Filter::DrawText(DrawText {
                font_file: font_file.clone(),
                font_size: style.font_size,
                text: text.clone(),
                x,
                y: y.clone(),
                font_color: style.highlight_text_color.clone(),
                border_width: style.highlight_border_width,
                border_color: style.highlight_border_color.clone(),
                enable: Some((round_to(word.start, 1), round_to(word.end, 1))),
            }));

            cursor += width + space;
        }
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dimension;
    use crate::layout::WordTiming;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn glyphs() -> GlyphWidths {
        let widths = HashMap::from([
            ('H', 50.0), ('E', 50.0), ('L', 50.0), ('O', 50.0),
            ('W', 60.0), ('R', 50.0), ('D', 50.0), (' ', 20.0),
        ]);
        GlyphWidths::from_map(widths, 80.0)
    }

    fn style() -> CaptionStyle {
        let settings = CaptionSettings {
            highlight_border_color: "red".to_string(),
            ..CaptionSettings::default()
        };
        CaptionStyle::resolve(&settings, VideoType::Horizontal, 1920, 1080, &mut StdRng::seed_from_u64(7))
    }

    fn hello_world_line() -> CaptionLine {
        CaptionLine {
            text: "HELLO WORLD".to_string(),
            words: vec![WordTiming::new("Hello", 0.0, 0.5), WordTiming::new("world", 0.5, 1.04)],
        }
    }

    #[test]
    fn test_style_resolves_percentages() {
        let style = style();
        // 6.8% of 1920 = 130.56
        assert_eq!(style.font_size, 130);
        // 13% of 130 = 16.9
        assert_eq!(style.highlight_border_width, 16);
        assert_eq!(style.border_width, 2);
        // 15% of 1080
        assert_eq!(style.offset, 162);
        assert_eq!(style.position, CaptionPosition::Middle);
        assert!((style.line_budget - 1632.0).abs() < 1e-9);
    }

    #[test]
    fn test_pixel_sizes_truncate() {
        let settings = CaptionSettings {
            font_size: Dimension::Percent(5.0),
            position_offset: Dimension::Percent(10.0),
            border_width: Dimension::Percent(3.0),
            ..CaptionSettings::default()
        };
        let style = CaptionStyle::resolve(&settings, VideoType::Horizontal, 1999, 1079, &mut StdRng::seed_from_u64(3));
        // 99.95 -> 99, 107.9 -> 107, 2.97 -> 2
        assert_eq!(style.font_size, 99);
        assert_eq!(style.offset, 107);
        assert_eq!(style.border_width, 2);
    }

    #[test]
    fn test_vertical_uses_vertical_font_size() {
        let settings = CaptionSettings {
            vertical_font_size: Dimension::Percent(10.0),
            ..CaptionSettings::default()
        };
        let style = CaptionStyle::resolve(&settings, VideoType::Vertical, 1080, 1920, &mut StdRng::seed_from_u64(1));
        assert_eq!(style.font_size, 108);
    }

    #[test]
    fn test_two_layers_per_word() {
        let chain = build_overlay_expression(&[hello_world_line()], 1920, &style(), &glyphs());
        assert_eq!(chain.filters.len(), 4);
        assert!(chain.inputs.is_empty() && chain.outputs.is_empty());

        let draws: Vec<&DrawText> = chain
            .filters
            .iter()
            .map(|f| match f {
                Filter::DrawText(dt) => dt,
                other => panic!("unexpected filter {:?}", other),
            })
            .collect();

        // phrase is 530px wide, centred in 1920 -> starts at 695
        assert_eq!(draws[0].x, "695.00");
        assert_eq!(draws[1].x, "695.00");
        assert_eq!(draws[2].x, "965.00");
        assert_eq!(draws[0].enable, Some((0.0, 1.0)));
        assert_eq!(draws[1].enable, Some((0.0, 0.5)));
        assert_eq!(draws[2].enable, Some((0.0, 1.0)));
        assert_eq!(draws[3].enable, Some((0.5, 1.0)));
        assert_eq!(draws[1].border_color, "red");
        assert_eq!(draws[0].border_color, "blue");
        assert_eq!(draws[3].text, "WORLD");
    }

    #[test]
    fn test_expression_text() {
        let chain = build_overlay_expression(&[hello_world_line()], 1920, &style(), &glyphs());
        let text = chain.to_string();
        assert_eq!(text.matches("drawtext=").count(), 4);
        assert!(text.contains(":y=(h-text_h)/2:"));
        assert!(text.contains("enable='between(t\\,0.5\\,1.0)'"));
        assert!(text.contains("text='HELLO'"));
    }

    #[test]
    fn test_y_expressions() {
        assert_eq!(CaptionPosition::Top.y_expr(40), "40");
        assert_eq!(CaptionPosition::Bottom.y_expr(40), "h-(text_h+40)");
        assert_eq!(CaptionPosition::Middle.y_expr(40), "(h-text_h)/2");
    }

    #[test]
    fn test_unknown_position_is_random_but_valid() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let position = CaptionPosition::resolve("diagonal", &mut rng);
            assert!(CaptionPosition::ALL.contains(&position));
            seen.insert(format!("{:?}", position));
        }
        assert!(seen.len() > 1);
        assert_eq!(CaptionPosition::resolve("BOTTOM", &mut rng), CaptionPosition::Bottom);
    }

    #[test]
    fn test_random_highlight_border_comes_from_palette() {
        let settings = CaptionSettings::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let style = CaptionStyle::resolve(&settings, VideoType::Horizontal, 1920, 1080, &mut rng);
            assert!(settings.palette.contains(&style.highlight_border_color));
        }

        let empty = CaptionSettings { palette: Vec::new(), ..CaptionSettings::default() };
        let style = CaptionStyle::resolve(&empty, VideoType::Horizontal, 1920, 1080, &mut rng);
        assert_eq!(style.highlight_border_color, "blue");
    }
}
