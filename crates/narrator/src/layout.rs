use serde::{Deserialize, Serialize};

use crate::glyphs::GlyphWidths;
use crate::text::display_word;

/// One spoken word on the narration timeline, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

impl WordTiming {
    pub fn new(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self { word: word.into(), start, end }
    }
}

/// Consecutive words rendered together as one caption
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLine {
    /// Uppercased display text, words joined by single spaces
    pub text: String,
    pub words: Vec<WordTiming>,
}

impl CaptionLine {
    /// Time window during which the whole line is visible
    pub fn window(&self) -> (f64, f64) {
        let start = self.words.first().map_or(0.0, |w| w.start);
        let end = self.words.last().map_or(start, |w| w.end);
        (start, end)
    }
}

/// Greedy caption packer for a fixed font and pixel budget
#[derive(Debug, Clone)]
pub struct CaptionLayout<'a> {
    glyphs: &'a GlyphWidths,
    budget: f64,
    max_words: Option<usize>,
}

impl<'a> CaptionLayout<'a> {
    pub fn new(glyphs: &'a GlyphWidths, budget: f64) -> Self {
        Self { glyphs, budget, max_words: None }
    }

    /// Additionally cap the number of words per line
    pub fn with_max_words(mut self, max_words: Option<usize>) -> Self {
        self.max_words = max_words.filter(|n| *n > 0);
        self
    }

    /// Rendered width of a word as it appears on screen
    pub fn word_width(&self, word: &str) -> f64 {
        self.glyphs.text_width(&display_word(word))
    }

    /// Rendered width of a line: word widths plus one space between neighbours
    pub fn line_width(&self, words: &[WordTiming]) -> f64 {
        let words_width: f64 = words.iter().map(|w| self.word_width(&w.word)).sum();
        let gaps = words.len().saturating_sub(1) as f64;
        words_width + gaps * self.glyphs.space_width()
    }

    /// Pack words into lines, preserving order
    ///
    /// A word joins the current line while `running + space + word <= budget`.
    /// A word wider than the budget on its own gets a line to itself.
    pub fn pack(&self, words: &[WordTiming]) -> Vec<CaptionLine> {
        let space = self.glyphs.space_width();
        let mut lines = Vec::new();
        let mut current: Vec<WordTiming> = Vec::new();
        let mut running = 0.0;

        for word in words {
            let width = self.word_width(&word.word);
            if !current.is_empty() {
                let fits = running + space + width <= self.budget;
                let room = self.max_words.map_or(true, |max| current.len() < max);
                if fits && room {
                    running += space + width;
                    current.push(word.clone());
                    continue;
                }
                lines.push(make_line(std::mem::take(&mut current)));
            }
            running = width;
            current.push(word.clone());
        }

        if !current.is_empty() {
            lines.push(make_line(current));
        }
        lines
    }
}

fn make_line(words: Vec<WordTiming>) -> CaptionLine {
    let text = words
        .iter()
        .map(|w| display_word(&w.word))
        .collect::<Vec<_>>()
        .join(" ");
    CaptionLine { text, words }
}

/// Move chunk-relative word timings onto the job timeline
pub fn shift_timings(words: &mut [WordTiming], offset: f64) {
    for word in words {
        word.start += offset;
        word.end += offset;
    }
}
