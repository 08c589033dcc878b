//! Typed ffmpeg filter graphs.
//!
//! Graphs are built from [`Filter`] nodes grouped into labelled [`FilterChain`]s
//! and only turned into ffmpeg's textual syntax by the `Display` impls here, so
//! escaping lives in one place.

use std::fmt;

use crate::text::{escape_drawtext, escape_filter_path};

/// Format seconds with millisecond precision, trimming trailing zeros
fn secs(value: f64) -> String {
    let s = format!("{:.3}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" { "0".to_string() } else { s.to_string() }
}

/// Output channel layout for `pan`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanLayout {
    /// Keep left and right as they are
    Stereo,
    /// Duplicate a mono source into both channels
    MonoToStereo,
}

/// Text drawn over every frame inside its enable window
#[derive(Debug, Clone, PartialEq)]
pub struct DrawText {
    pub font_file: String,
    pub font_size: u32,
    pub text: String,
    /// Expression or pixel value for the left edge
    pub x: String,
    /// Expression or pixel value for the top edge
    pub y: String,
    pub font_color: String,
    pub border_width: u32,
    pub border_color: String,
    /// Visible only between these timestamps
    pub enable: Option<(f64, f64)>,
}

/// One filter node
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Trim { start: f64, end: f64 },
    ATrim { start: f64, end: f64 },
    SetPts,
    ASetPts,
    /// Fit inside `width`x`height`, keeping aspect ratio
    ScaleToFit { width: u32, height: u32 },
    /// Center on a `width`x`height` canvas
    PadCenter { width: u32, height: u32 },
    SetSar { num: u32, den: u32 },
    Format(String),
    AResample(u32),
    Pan(PanLayout),
    /// Silent stereo source of `duration` seconds
    SilentSource { duration: f64, sample_rate: u32 },
    VolumeDetect,
    Concat { segments: usize, video: usize, audio: usize },
    DrawText(DrawText),
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Trim { start, end } => write!(f, "trim=start={}:end={}", secs(*start), secs(*end)),
            Filter::ATrim { start, end } => write!(f, "atrim=start={}:end={}", secs(*start), secs(*end)),
            Filter::SetPts => f.write_str("setpts=PTS-STARTPTS"),
            Filter::ASetPts => f.write_str("asetpts=PTS-STARTPTS"),
            Filter::ScaleToFit { width, height } => {
                write!(f, "scale={}:{}:force_original_aspect_ratio=decrease", width, height)
            }
            Filter::PadCenter { width, height } => {
                write!(f, "pad={}:{}:(ow-iw)/2:(oh-ih)/2", width, height)
            }
            Filter::SetSar { num, den } => write!(f, "setsar={}/{}", num, den),
            Filter::Format(pix_fmt) => write!(f, "format={}", pix_fmt),
            Filter::AResample(rate) => write!(f, "aresample={}", rate),
            Filter::Pan(PanLayout::Stereo) => f.write_str("pan=stereo|c0=c0|c1=c1"),
            Filter::Pan(PanLayout::MonoToStereo) => f.write_str("pan=stereo|c0=c0|c1=c0"),
            Filter::SilentSource { duration, sample_rate } => {
                write!(f, "aevalsrc=0|0:d={}:s={}", secs(*duration), sample_rate)
            }
            Filter::VolumeDetect => f.write_str("volumedetect"),
            Filter::Concat { segments, video, audio } => {
                write!(f, "concat=n={}:v={}:a={}", segments, video, audio)
            }
            Filter::DrawText(dt) => {
                write!(
                    f,
                    "drawtext=fontfile={}:fontsize={}:text='{}':x={}:y={}:fontcolor={}:borderw={}:bordercolor={}:box=0",
                    escape_filter_path(&dt.font_file),
                    dt.font_size,
                    escape_drawtext(&dt.text),
                    dt.x,
                    dt.y,
                    dt.font_color,
                    dt.border_width,
                    dt.border_color,
                )?;
                if let Some((start, end)) = dt.enable {
                    write!(f, ":enable='between(t\\,{:.1}\\,{:.1})'", start, end)?;
                }
                Ok(())
            }
        }
    }
}

/// Stream label such as `0:v` or `outv`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pad(pub String);

impl Pad {
    pub fn input_video(index: usize) -> Self {
        Pad(format!("{}:v", index))
    }

    pub fn input_audio(index: usize) -> Self {
        Pad(format!("{}:a", index))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Pad(name.into())
    }
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// Filters applied in sequence between input and output labels
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterChain {
    pub inputs: Vec<Pad>,
    pub filters: Vec<Filter>,
    pub outputs: Vec<Pad>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, pad: Pad) -> Self {
        self.inputs.push(pad);
        self
    }

    pub fn then(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn output(mut self, pad: Pad) -> Self {
        self.outputs.push(pad);
        self
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pad in &self.inputs {
            write!(f, "{}", pad)?;
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", filter)?;
        }
        for pad in &self.outputs {
            write!(f, "{}", pad)?;
        }
        Ok(())
    }
}

/// Complete graph for `-filter_complex`; chains are separated by `;`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterGraph {
    pub chains: Vec<FilterChain>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chain: FilterChain) {
        self.chains.push(chain);
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chain) in self.chains.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", chain)?;
        }
        Ok(())
    }
}

/// How one background segment gets its audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAudio {
    /// Use the clip's own audio stream with this many channels
    Source { channels: u32 },
    /// Replace with generated silence
    Silent,
}

/// Output frame and encoding parameters shared by every background segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub sample_rate: u32,
}

/// Graph trimming each input to `segment_secs`, fitting it to the frame and
/// concatenating everything into `[outv][outa]`
pub fn background_graph(segments: &[SegmentAudio], segment_secs: f64, format: &SegmentFormat) -> FilterGraph {
    let mut graph = FilterGraph::new();

    for (i, audio) in segments.iter().enumerate() {
        graph.push(
            FilterChain::new()
                .input(Pad::input_video(i))
                .then(Filter::Trim { start: 0.0, end: segment_secs })
                .then(Filter::SetPts)
                .then(Filter::ScaleToFit { width: format.width, height: format.height })
                .then(Filter::PadCenter { width: format.width, height: format.height })
                .then(Filter::SetSar { num: 1, den: 1 })
                .then(Filter::Format(format.pixel_format.clone()))
                .output(Pad::named(format!("v{}", i))),
        );

        let audio_chain = match audio {
            SegmentAudio::Source { channels } => FilterChain::new()
                .input(Pad::input_audio(i))
                .then(Filter::ATrim { start: 0.0, end: segment_secs })
                .then(Filter::ASetPts)
                .then(Filter::AResample(format.sample_rate))
                .then(Filter::Pan(if *channels == 1 { PanLayout::MonoToStereo } else { PanLayout::Stereo })),
            SegmentAudio::Silent => FilterChain::new()
                .then(Filter::SilentSource { duration: segment_secs, sample_rate: format.sample_rate })
                .then(Filter::Pan(PanLayout::Stereo)),
        };
        graph.push(audio_chain.output(Pad::named(format!("a{}", i))));
    }

    let mut concat = FilterChain::new();
    for i in 0..segments.len() {
        concat = concat
            .input(Pad::named(format!("v{}", i)))
            .input(Pad::named(format!("a{}", i)));
    }
    graph.push(
        concat
            .then(Filter::Concat { segments: segments.len(), video: 1, audio: 1 })
            .output(Pad::named("outv"))
            .output(Pad::named("outa")),
    );

    graph
}
