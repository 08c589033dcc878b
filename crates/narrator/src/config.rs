use std::fmt;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the narrator engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarratorConfig {
    /// Directory holding one subdirectory per job
    pub store_dir: PathBuf,
    /// Interval in seconds between command-directory sweeps in the daemon
    pub command_poll_secs: u64,
    pub api: ApiSettings,
    pub tts: TtsSettings,
    pub transcriber: TranscriberSettings,
    pub video: VideoSettings,
    pub ffmpeg: FfmpegSettings,
    pub captions: CaptionSettings,
}

/// Submission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Maximum number of jobs in `processing` at once
    pub max_jobs: usize,
    /// Maximum accepted text length in characters
    pub max_text_length: usize,
}

/// Speech synthesis collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    /// Program invoked to synthesize speech
    pub program: PathBuf,
    pub language: String,
    pub voice: String,
    /// Sample rate of the samples the synthesizer returns
    pub sample_rate: u32,
    pub speech_rate: f32,
}

/// Speech-to-text collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberSettings {
    /// Program invoked to produce word timings
    pub program: PathBuf,
    pub model: String,
    /// Transcription language; `None` derives it from the job language
    pub language: Option<String>,
}

/// Named output resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Background footage and output frame settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub background_dir: PathBuf,
    pub vertical_background_dir: PathBuf,
    /// Output width used when a job names no quality preset
    pub width: u32,
    /// Output height used when a job names no quality preset
    pub height: u32,
    pub fps: u32,
    /// Length in seconds of every background segment
    pub max_segment_secs: f64,
    pub allowed_extensions: Vec<String>,
    pub qualities: Vec<QualityPreset>,
}

/// External transcoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegSettings {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub video_codec: String,
    pub video_format: String,
    pub pixel_format: String,
    pub preset: String,
    pub audio_codec: String,
    pub audio_format: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Apply `normalization_filter` when encoding narration chunks
    pub apply_normalization: bool,
    pub normalization_filter: String,
    /// Linear mean volume below which a clip counts as silent
    pub silence_threshold: f64,
}

/// Caption styling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionSettings {
    pub font_path: PathBuf,
    /// Font size for horizontal output, relative to video width
    pub font_size: Dimension,
    /// Font size for vertical output, relative to video width
    pub vertical_font_size: Dimension,
    /// Share of the video width a caption line may occupy
    pub line_usage_percent: f64,
    pub max_words_per_line: Option<usize>,
    /// One of top, bottom, middle; anything else picks one at random per build
    pub position: String,
    /// Vertical offset relative to video height
    pub position_offset: Dimension,
    pub text_color: String,
    pub border_color: String,
    /// Relative to font size
    pub border_width: Dimension,
    pub highlight_text_color: String,
    /// A color name, or "random" to draw one from `palette`
    pub highlight_border_color: String,
    /// Relative to font size
    pub highlight_border_width: Dimension,
    pub palette: Vec<String>,
}

/// A length given either in pixels or as a percentage of a reference length
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DimensionRepr", into = "DimensionRepr")]
pub enum Dimension {
    Pixels(f64),
    Percent(f64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DimensionRepr {
    Number(f64),
    Text(String),
}

impl Dimension {
    /// Resolve against `reference` (video width, video height or font size)
    pub fn resolve(&self, reference: f64) -> f64 {
        match *self {
            Dimension::Pixels(px) => px,
            Dimension::Percent(pct) => reference * pct / 100.0,
        }
    }

    /// Parse `"6.8%"`, `"12px"` or `"12"`
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Some(pct) = value.strip_suffix('%') {
            let pct: f64 = pct.trim().parse()
                .with_context(|| format!("Invalid percentage: {}", value))?;
            return Ok(Dimension::Percent(pct));
        }
        let px = value.strip_suffix("px").unwrap_or(value);
        let px: f64 = px.trim().parse()
            .with_context(|| format!("Invalid pixel length: {}", value))?;
        Ok(Dimension::Pixels(px))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Pixels(px) => write!(f, "{}", px),
            Dimension::Percent(pct) => write!(f, "{}%", pct),
        }
    }
}

impl TryFrom<DimensionRepr> for Dimension {
    type Error = String;

    fn try_from(repr: DimensionRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            DimensionRepr::Number(px) => Ok(Dimension::Pixels(px)),
            DimensionRepr::Text(text) => Dimension::parse(&text).map_err(|e| e.to_string()),
        }
    }
}

impl From<Dimension> for DimensionRepr {
    fn from(dim: Dimension) -> Self {
        match dim {
            Dimension::Pixels(px) => DimensionRepr::Number(px),
            Dimension::Percent(_) => DimensionRepr::Text(dim.to_string()),
        }
    }
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            max_text_length: 6500,
        }
    }
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("kokoro-tts"),
            language: "en-us".to_string(),
            voice: "af_nova".to_string(),
            sample_rate: 24000,
            speech_rate: 1.0,
        }
    }
}

impl Default for TranscriberSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("whisper-words"),
            model: "turbo".to_string(),
            language: None,
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            background_dir: PathBuf::from("./Assets/Videos/Horizontal"),
            vertical_background_dir: PathBuf::from("./Assets/Videos/Vertical"),
            width: 3840,
            height: 2160,
            fps: 30,
            max_segment_secs: 5.0,
            allowed_extensions: ["mp4", "avi", "mov", "mkv"].iter().map(|s| s.to_string()).collect(),
            qualities: vec![
                QualityPreset { name: "4K".to_string(), width: 3840, height: 2160 },
                QualityPreset { name: "Full HD".to_string(), width: 1920, height: 1080 },
                QualityPreset { name: "HD".to_string(), width: 1280, height: 720 },
                QualityPreset { name: "480p".to_string(), width: 854, height: 480 },
            ],
        }
    }
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            video_codec: "libx264".to_string(),
            video_format: "mp4".to_string(),
            pixel_format: "yuv420p".to_string(),
            preset: "fast".to_string(),
            audio_codec: "libmp3lame".to_string(),
            audio_format: "mp3".to_string(),
            audio_bitrate: "256k".to_string(),
            sample_rate: 44100,
            channels: 2,
            apply_normalization: true,
            normalization_filter: "loudnorm".to_string(),
            silence_threshold: 0.01,
        }
    }
}

impl Default for CaptionSettings {
    fn default() -> Self {
        Self {
            font_path: PathBuf::from("./Assets/Fonts/BarlowCondensed-Bold.ttf"),
            font_size: Dimension::Percent(6.8),
            vertical_font_size: Dimension::Percent(12.0),
            line_usage_percent: 85.0,
            max_words_per_line: None,
            position: "middle".to_string(),
            position_offset: Dimension::Percent(15.0),
            text_color: "white".to_string(),
            border_color: "blue".to_string(),
            border_width: Dimension::Pixels(2.0),
            highlight_text_color: "white".to_string(),
            highlight_border_color: "random".to_string(),
            highlight_border_width: Dimension::Percent(13.0),
            palette: [
                "red", "green", "blue", "magenta", "black", "lightgray", "orange",
                "purple", "pink", "brown", "gray", "lightblue", "darkgreen",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl VideoSettings {
    /// Look up a quality preset by name, case-insensitively
    pub fn quality(&self, name: &str) -> Option<&QualityPreset> {
        self.qualities.iter().find(|q| q.name.eq_ignore_ascii_case(name))
    }
}

impl NarratorConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            store_dir: PathBuf::from("./Jobs"),
            command_poll_secs: 2,
            api: ApiSettings::default(),
            tts: TtsSettings::default(),
            transcriber: TranscriberSettings::default(),
            video: VideoSettings::default(),
            ffmpeg: FfmpegSettings::default(),
            captions: CaptionSettings::default(),
        }
    }

    /// Directory the daemon watches for command files from other processes
    pub fn command_dir(&self) -> PathBuf {
        self.store_dir.join(".commands")
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }
}
