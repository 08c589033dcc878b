use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{TranscriberSettings, TtsSettings};
use crate::executor::run_captured;
use crate::layout::WordTiming;

/// One synthesized stretch of narration
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedChunk {
    pub text: String,
    pub phonemes: String,
    /// Mono samples in `[-1, 1]`
    pub samples: Vec<f32>,
}

/// Text-to-speech collaborator
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Sample rate of every returned chunk
    fn sample_rate(&self) -> u32;

    /// Synthesize `text` into ordered chunks
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice: &str,
        rate: f32,
    ) -> Result<Vec<SynthesizedChunk>>;
}

/// Speech recognized in one audio file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
    /// Length of the transcribed audio in seconds
    pub duration: f64,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

impl Transcription {
    /// Every word with a non-empty trimmed spelling, in order
    pub fn words(&self) -> Vec<WordTiming> {
        self.segments
            .iter()
            .flat_map(|s| s.words.iter())
            .filter_map(|w| {
                let word = w.word.trim();
                (!word.is_empty()).then(|| WordTiming::new(word, w.start, w.end))
            })
            .collect()
    }
}

/// Speech-to-text collaborator
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<Transcription>;
}

/// Manifest printed by the synthesizer program
#[derive(Debug, Deserialize)]
struct SynthesisManifest {
    chunks: Vec<ManifestChunk>,
}

#[derive(Debug, Deserialize)]
struct ManifestChunk {
    text: String,
    #[serde(default)]
    phonemes: String,
    /// Raw little-endian f32 samples written by the program
    samples_path: PathBuf,
}

/// Decode raw little-endian f32 samples
pub fn decode_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Encode samples as raw little-endian f32
pub fn encode_f32le(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

static NEXT_CALL: AtomicU64 = AtomicU64::new(0);

/// Synthesizer that shells out to a TTS program
///
/// The program is called as
/// `<program> --text-file F --language L --voice V --speed R --sample-rate S --output-dir D`
/// and must print a JSON manifest `{"chunks": [{"text", "phonemes", "samples_path"}]}`.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: PathBuf,
    sample_rate: u32,
    work_dir: PathBuf,
}

impl CommandSynthesizer {
    pub fn new(settings: &TtsSettings, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: settings.program.clone(),
            sample_rate: settings.sample_rate,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice: &str,
        rate: f32,
    ) -> Result<Vec<SynthesizedChunk>> {
        let call = NEXT_CALL.fetch_add(1, Ordering::Relaxed);
        let scratch = self.work_dir.join(format!(".tts-{}-{}", std::process::id(), call));
        tokio::fs::create_dir_all(&scratch).await
            .with_context(|| format!("Failed to create TTS scratch dir: {}", scratch.display()))?;

        let result = self.synthesize_in(&scratch, text, language, voice, rate).await;

        // every exit path passes through here
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Failed to remove TTS scratch dir {}: {}", scratch.display(), e);
        }
        result
    }
}

impl CommandSynthesizer {
    async fn synthesize_in(
        &self,
        scratch: &Path,
        text: &str,
        language: &str,
        voice: &str,
        rate: f32,
    ) -> Result<Vec<SynthesizedChunk>> {
        let text_file = scratch.join("input.txt");
        tokio::fs::write(&text_file, text).await
            .with_context(|| format!("Failed to write TTS input: {}", text_file.display()))?;

        let args = vec![
            "--text-file".to_string(),
            text_file.display().to_string(),
            "--language".to_string(),
            language.to_string(),
            "--voice".to_string(),
            voice.to_string(),
            "--speed".to_string(),
            rate.to_string(),
            "--sample-rate".to_string(),
            self.sample_rate.to_string(),
            "--output-dir".to_string(),
            scratch.display().to_string(),
        ];
        debug!("Executing TTS: {} {}", self.program.display(), args.join(" "));
        let output = run_captured(&self.program, &args).await?;
        if !output.success {
            bail!(
                "Speech synthesis failed (exit code {}):\n{}",
                output.exit_code.unwrap_or(-1),
                output.stderr
            );
        }

        let manifest: SynthesisManifest = serde_json::from_str(&output.stdout)
            .context("Failed to parse TTS manifest")?;

        let mut chunks = Vec::with_capacity(manifest.chunks.len());
        for entry in manifest.chunks {
            let bytes = tokio::fs::read(&entry.samples_path).await
                .with_context(|| format!("Failed to read TTS samples: {}", entry.samples_path.display()))?;
            chunks.push(SynthesizedChunk {
                text: entry.text,
                phonemes: entry.phonemes,
                samples: decode_f32le(&bytes),
            });
        }
        Ok(chunks)
    }
}

/// Transcriber that shells out to a word-timestamp speech recognizer
///
/// Called as `<program> --model M --language L --word-timestamps <audio>`; stdout
/// must be a JSON [`Transcription`].
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: PathBuf,
    model: String,
}

impl CommandTranscriber {
    pub fn new(settings: &TranscriberSettings) -> Self {
        Self {
            program: settings.program.clone(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<Transcription> {
        if !audio.exists() {
            return Err(anyhow!("Audio file does not exist: {}", audio.display()));
        }
        let args = vec![
            "--model".to_string(),
            self.model.clone(),
            "--language".to_string(),
            language.to_string(),
            "--word-timestamps".to_string(),
            audio.display().to_string(),
        ];
        debug!("Executing transcriber: {} {}", self.program.display(), args.join(" "));
        let output = run_captured(&self.program, &args).await?;
        if !output.success {
            bail!(
                "Transcription failed for {} (exit code {}):\n{}",
                audio.display(),
                output.exit_code.unwrap_or(-1),
                output.stderr
            );
        }
        serde_json::from_str(&output.stdout)
            .with_context(|| format!("Failed to parse transcription of {}", audio.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_codec() {
        let samples = vec![0.0f32, 0.5, -1.0, 0.25];
        let bytes = encode_f32le(&samples);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_f32le(&bytes), samples);
        // a trailing partial sample is ignored
        assert_eq!(decode_f32le(&bytes[..6]), vec![0.0]);
    }

    #[test]
    fn test_transcription_words_are_trimmed_and_flattened() {
        let json = r#"{
            "text": " Hello world. Again",
            "duration": 2.4,
            "segments": [
                {"start": 0.0, "end": 1.0, "text": " Hello world.",
                 "words": [{"word": " Hello", "start": 0.0, "end": 0.5}, {"word": " world.", "start": 0.5, "end": 1.0}]},
                {"start": 1.2, "end": 2.4, "text": " Again",
                 "words": [{"word": "  ", "start": 1.2, "end": 1.3}, {"word": " Again", "start": 1.3, "end": 2.4}]}
            ]
        }"#;
        let transcription: Transcription = serde_json::from_str(json).unwrap();
        let words = transcription.words();
        assert_eq!(
            words,
            vec![
                WordTiming::new("Hello", 0.0, 0.5),
                WordTiming::new("world.", 0.5, 1.0),
                WordTiming::new("Again", 1.3, 2.4),
            ]
        );
        assert_eq!(transcription.duration, 2.4);
    }

    #[cfg(unix)]
    fn fake_tts(dir: &Path, body: &str) -> CommandSynthesizer {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.join("fake-tts.sh");
        std::fs::write(&program, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        let settings = TtsSettings { program, ..TtsSettings::default() };
        CommandSynthesizer::new(&settings, dir.join("work"))
    }

    fn scratch_dirs(work_dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(work_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_synthesizer_reads_manifest_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        // ${12} is the output directory; 0x3f000000 is 0.5 as f32
        let tts = fake_tts(
            dir.path(),
            r#"printf '\000\000\000\077' > "${12}/0.f32"
echo "{\"chunks\": [{\"text\": \"Hello.\", \"phonemes\": \"hə\", \"samples_path\": \"${12}/0.f32\"}]}""#,
        );

        let chunks = tts.synthesize("Hello.", "en-us", "af_nova", 1.0).await.unwrap();
        assert_eq!(
            chunks,
            vec![SynthesizedChunk { text: "Hello.".into(), phonemes: "hə".into(), samples: vec![0.5] }]
        );
        assert!(scratch_dirs(&dir.path().join("work")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_synthesizer_cleans_up_after_bad_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let tts = fake_tts(dir.path(), "echo 'this is not json'");

        let err = tts.synthesize("Hello.", "en-us", "af_nova", 1.0).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse TTS manifest"));
        assert!(scratch_dirs(&dir.path().join("work")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_synthesizer_cleans_up_after_missing_samples() {
        let dir = tempfile::tempdir().unwrap();
        let tts = fake_tts(
            dir.path(),
            r#"echo "{\"chunks\": [{\"text\": \"Hi\", \"samples_path\": \"${12}/missing.f32\"}]}""#,
        );

        let err = tts.synthesize("Hi", "en-us", "af_nova", 1.0).await.unwrap_err();
        assert!(err.to_string().contains("Failed to read TTS samples"));
        assert!(scratch_dirs(&dir.path().join("work")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_synthesizer_cleans_up_after_failed_exit() {
        let dir = tempfile::tempdir().unwrap();
        let tts = fake_tts(dir.path(), "echo 'voice not found' >&2\nexit 3");

        let err = tts.synthesize("Hi", "en-us", "af_nova", 1.0).await.unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
        assert!(err.to_string().contains("voice not found"));
        assert!(scratch_dirs(&dir.path().join("work")).is_empty());
    }

    #[tokio::test]
    async fn test_transcriber_rejects_missing_audio() {
        let transcriber = CommandTranscriber::new(&TranscriberSettings::default());
        let err = transcriber.transcribe(Path::new("/nonexistent/a.mp3"), "en").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
