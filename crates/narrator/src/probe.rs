use std::path::Path;
use std::sync::Arc;
use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::Deserialize;

use crate::executor::{FfmpegCommand, TranscodeExecutor};
use crate::filtergraph::Filter;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: ProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    pub format_name: Option<String>,
    /// Seconds, as ffprobe prints it
    pub duration: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<u32>,
    pub duration: Option<String>,
}

impl ProbeData {
    fn first_stream(&self, kind: &str) -> Option<&ProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some(kind))
    }

    /// Container duration, falling back to the longest stream duration
    pub fn duration(&self) -> Option<f64> {
        let container = self.format.duration.as_deref().and_then(|d| d.parse::<f64>().ok());
        container.or_else(|| {
            self.streams
                .iter()
                .filter_map(|s| s.duration.as_deref().and_then(|d| d.parse::<f64>().ok()))
                .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))))
        })
    }
}

/// Sizing facts about one media file
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub has_audio: bool,
    /// Channel count of the first audio stream
    pub audio_channels: Option<u32>,
}

impl From<&ProbeData> for MediaInfo {
    fn from(data: &ProbeData) -> Self {
        let video = data.first_stream("video");
        let audio = data.first_stream("audio");
        Self {
            duration: data.duration().unwrap_or(0.0),
            width: video.and_then(|s| s.width),
            height: video.and_then(|s| s.height),
            has_audio: audio.is_some(),
            audio_channels: audio.and_then(|s| s.channels),
        }
    }
}

/// Extract `mean_volume: <x> dB` from volumedetect's stderr
pub fn parse_mean_volume(stderr: &str) -> Option<f64> {
    stderr.lines().find_map(|line| {
        let (_, rest) = line.split_once("mean_volume:")?;
        let value = rest.trim().trim_end_matches("dB").trim();
        value.parse::<f64>().ok()
    })
}

/// Convert decibels to a linear amplitude ratio
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Media inspection on top of a transcode executor
#[derive(Clone)]
pub struct MediaProbe {
    executor: Arc<dyn TranscodeExecutor>,
    silence_threshold: f64,
}

impl MediaProbe {
    pub fn new(executor: Arc<dyn TranscodeExecutor>, silence_threshold: f64) -> Self {
        Self { executor, silence_threshold }
    }

    /// Duration, dimensions and stream presence of `path`
    pub async fn inspect(&self, path: &Path) -> Result<MediaInfo> {
        let data = self.executor.probe(path).await?;
        let info = MediaInfo::from(&data);
        debug!(
            "Probed {}: {:.2}s {:?}x{:?} audio={}",
            path.display(),
            info.duration,
            info.width,
            info.height,
            info.has_audio
        );
        Ok(info)
    }

    /// Duration of `path` in seconds; a file without a readable duration is an error
    pub async fn duration(&self, path: &Path) -> Result<f64> {
        let data = self.executor.probe(path).await?;
        data.duration()
            .ok_or_else(|| anyhow!("No duration reported for {}", path.display()))
    }

    /// Mean volume in dB over the first `window` seconds, if the analysis succeeds
    pub async fn mean_volume_db(&self, path: &Path, window: Option<f64>) -> Result<Option<f64>> {
        let mut cmd = FfmpegCommand::new();
        if let Some(secs) = window {
            cmd = cmd.opt("-t", format!("{:.3}", secs));
        }
        let args = cmd
            .input(path)
            .opt("-af", Filter::VolumeDetect)
            .arg("-vn")
            .arg("-sn")
            .opt("-f", "null")
            .arg("-")
            .build_args();

        let output = self.executor.run(args).await?;
        if !output.success {
            warn!("Volume analysis failed for {} (exit {:?})", path.display(), output.exit_code);
            return Ok(None);
        }
        Ok(parse_mean_volume(&output.stderr))
    }

    /// Whether `path` lacks usable audio: no audio stream, or mean volume under the threshold
    pub async fn is_silent(&self, info: &MediaInfo, path: &Path, window: Option<f64>) -> Result<bool> {
        if !info.has_audio {
            return Ok(true);
        }
        match self.mean_volume_db(path, window).await? {
            Some(db) => Ok(db_to_linear(db) < self.silence_threshold),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "duration": "12.5"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "channels": 1, "duration": "12.4"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.512"}
    }"#;

    #[test]
    fn test_media_info_from_probe_json() {
        let data: ProbeData = serde_json::from_str(PROBE_JSON).unwrap();
        let info = MediaInfo::from(&data);
        assert_eq!(info.duration, 12.512);
        assert_eq!(info.width, Some(1920));
        assert_eq!(info.height, Some(1080));
        assert!(info.has_audio);
        assert_eq!(info.audio_channels, Some(1));
    }

    #[test]
    fn test_duration_falls_back_to_streams() {
        let data: ProbeData = serde_json::from_str(
            r#"{"streams": [{"codec_type": "audio", "duration": "3.5"}, {"codec_type": "video", "duration": "4.0"}], "format": {}}"#,
        )
        .unwrap();
        assert_eq!(data.duration(), Some(4.0));
        assert!(MediaInfo::from(&data).width.is_none());
    }

    #[test]
    fn test_parse_mean_volume() {
        let stderr = "[Parsed_volumedetect_0 @ 0x55] n_samples: 88200\n\
                      [Parsed_volumedetect_0 @ 0x55] mean_volume: -27.3 dB\n\
                      [Parsed_volumedetect_0 @ 0x55] max_volume: -4.0 dB";
        assert_eq!(parse_mean_volume(stderr), Some(-27.3));
        assert_eq!(parse_mean_volume("nothing here"), None);
    }

    #[test]
    fn test_db_to_linear() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-12);
        assert!((db_to_linear(-40.0) - 0.01).abs() < 1e-12);
        // -91 dB is what volumedetect reports for digital silence
        assert!(db_to_linear(-91.0) < 0.01);
    }
}
