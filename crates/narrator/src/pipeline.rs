//! End-to-end assembly of one narrated, captioned video.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use walkdir::WalkDir;

use crate::catalog::{primary_language, resolve_voice};
use crate::config::NarratorConfig;
use crate::error::PipelineError;
use crate::executor::{FfmpegCommand, TranscodeExecutor};
use crate::filtergraph::{background_graph, SegmentAudio, SegmentFormat};
use crate::glyphs::GlyphWidths;
use crate::job::{Job, VideoType};
use crate::layout::{shift_timings, CaptionLayout, CaptionLine, WordTiming};
use crate::overlay::{build_overlay_expression, CaptionStyle};
use crate::probe::{MediaInfo, MediaProbe};
use crate::scheduler::JobRunner;
use crate::speech::{encode_f32le, SpeechSynthesizer, Transcriber};
use crate::store::JobStore;
use crate::text::{clean_text, escape_concat_path};

/// Pipeline progress; each variant is reached once the step it names is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    TextReceived,
    NarrationSynthesized,
    Transcribed,
    CaptionsPlanned,
    BackgroundAssembled,
    Muxed,
    CaptionsBurned,
    Cleaned,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::TextReceived => "text_received",
            Stage::NarrationSynthesized => "narration_synthesized",
            Stage::Transcribed => "transcribed",
            Stage::CaptionsPlanned => "captions_planned",
            Stage::BackgroundAssembled => "background_assembled",
            Stage::Muxed => "muxed",
            Stage::CaptionsBurned => "captions_burned",
            Stage::Cleaned => "cleaned",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One synthesized narration chunk persisted for the job
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub text: String,
    pub phonemes: String,
    pub samples: Vec<f32>,
    pub file_path: PathBuf,
}

/// Background clip long enough to supply a full segment
#[derive(Debug, Clone, PartialEq)]
pub struct VideoCandidate {
    pub file_path: PathBuf,
    pub duration: f64,
    pub info: MediaInfo,
}

/// Number of `segment_secs` segments needed to cover `duration`
pub fn segments_required(duration: f64, segment_secs: f64) -> usize {
    if duration <= 0.0 || segment_secs <= 0.0 {
        return 1;
    }
    ((duration / segment_secs).ceil() as usize).max(1)
}

/// Output frame for a job: quality preset (or configured default), rotated for vertical output
pub fn frame_size(config: &NarratorConfig, job: &Job) -> (u32, u32) {
    let (w, h) = job
        .video_quality
        .as_deref()
        .and_then(|name| config.video.quality(name))
        .map(|q| (q.width, q.height))
        .unwrap_or((config.video.width, config.video.height));
    let (long, short) = (w.max(h), w.min(h));
    match job.video_type {
        VideoType::Horizontal => (long, short),
        VideoType::Vertical => (short, long),
    }
}

/// File layout inside one job directory
#[derive(Debug, Clone)]
struct JobPaths {
    dir: PathBuf,
    id: String,
    audio_ext: String,
    video_ext: String,
}

impl JobPaths {
    fn new(store_dir: &Path, job: &Job, config: &NarratorConfig) -> Self {
        Self {
            dir: job.dir(store_dir),
            id: job.id.clone(),
            audio_ext: config.ffmpeg.audio_format.clone(),
            video_ext: config.ffmpeg.video_format.clone(),
        }
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", self.id, suffix))
    }

    fn chunk_samples(&self, i: usize) -> PathBuf {
        self.file(&format!("{}.pcm", i))
    }

    fn chunk_audio(&self, i: usize) -> PathBuf {
        self.file(&format!("{}.{}", i, self.audio_ext))
    }

    fn chunk_list(&self) -> PathBuf {
        self.file("chunks.txt")
    }

    fn narration(&self) -> PathBuf {
        self.file(&format!("Merged.{}", self.audio_ext))
    }

    fn background(&self) -> PathBuf {
        self.file(&format!("Merged.{}", self.video_ext))
    }

    fn background_script(&self) -> PathBuf {
        self.file("background.filter")
    }

    fn muxed(&self) -> PathBuf {
        self.file(&format!("NoCaptions.{}", self.video_ext))
    }

    fn captions_script(&self) -> PathBuf {
        self.file("captions.filter")
    }

    fn final_video(&self) -> PathBuf {
        self.file(&format!("Final.{}", self.video_ext))
    }

    fn stderr_log(&self, stage: Stage) -> PathBuf {
        self.file(&format!("{}.stderr.log", stage))
    }
}

/// Captions laid out for a specific frame
struct CaptionPlan {
    width: u32,
    height: u32,
    style: CaptionStyle,
    glyphs: GlyphWidths,
    lines: Vec<CaptionLine>,
}

/// Text-to-video pipeline driven once per job by the scheduler
pub struct MediaAssemblyPipeline {
    config: Arc<NarratorConfig>,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn TranscodeExecutor>,
    probe: MediaProbe,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcriber: Arc<dyn Transcriber>,
}

impl MediaAssemblyPipeline {
    pub fn new(
        config: Arc<NarratorConfig>,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn TranscodeExecutor>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        let probe = MediaProbe::new(executor.clone(), config.ffmpeg.silence_threshold);
        Self { config, store, executor, probe, synthesizer, transcriber }
    }

    /// Record `stage` on the job and log it
    fn advance(&self, job_id: &str, stage: Stage) -> Result<(), PipelineError> {
        self.store
            .update(job_id, &mut |job| job.stage = Some(stage.to_string()))
            .map_err(|e| PipelineError::io(stage, e))?;
        info!("Job {}: ✅ {}", job_id, stage);
        Ok(())
    }

    /// Stop with `Canceled` if cancellation was requested
    fn checkpoint(&self, job_id: &str, reached: Stage) -> Result<(), PipelineError> {
        let requested = self.store.get(job_id).map_or(false, |job| job.cancel_requested);
        if requested {
            info!("Job {}: 🛑 Cancellation observed after {}", job_id, reached);
            return Err(PipelineError::Canceled { stage: reached });
        }
        Ok(())
    }

    /// Run one transcoder step; a non-zero exit keeps its stderr next to the job
    async fn transcode(&self, paths: &JobPaths, stage: Stage, args: Vec<String>) -> Result<(), PipelineError> {
        let output = self.executor.run(args).await.map_err(|e| PipelineError::io(stage, e))?;
        if output.success {
            return Ok(());
        }

        let log_path = paths.stderr_log(stage);
        if let Err(e) = tokio::fs::write(&log_path, &output.stderr).await {
            warn!("Job {}: Failed to save stderr to {}: {}", paths.id, log_path.display(), e);
        }
        let tail: Vec<&str> = output.stderr.lines().rev().take(5).collect();
        error!(
            "Job {}: ❌ Transcoder failed at {} (exit {:?}): {}",
            paths.id,
            stage,
            output.exit_code,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        );
        Err(PipelineError::Tool { stage, exit_code: output.exit_code, stderr_log: log_path })
    }

    async fn write_script(&self, path: &Path, contents: String, stage: Stage) -> Result<(), PipelineError> {
        debug!("Writing filter script {} ({} bytes)", path.display(), contents.len());
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write filter script: {}", path.display()))
            .map_err(|e| PipelineError::io(stage, e))
    }

    /// Persist one chunk as raw samples and encode it, normalizing loudness when enabled
    async fn store_chunk(&self, paths: &JobPaths, index: usize, samples: &[f32]) -> Result<PathBuf, PipelineError> {
        let stage = Stage::NarrationSynthesized;
        let ff = &self.config.ffmpeg;
        let raw = paths.chunk_samples(index);
        let out = paths.chunk_audio(index);

        tokio::fs::write(&raw, encode_f32le(samples))
            .await
            .with_context(|| format!("Failed to write samples: {}", raw.display()))
            .map_err(|e| PipelineError::io(stage, e))?;

        let encode = |normalize: bool| {
            let mut cmd = FfmpegCommand::new()
                .opt("-f", "f32le")
                .opt("-ar", self.synthesizer.sample_rate())
                .opt("-ac", 1)
                .input(&raw);
            if normalize {
                cmd = cmd.opt("-af", &ff.normalization_filter);
            }
            cmd.opt("-c:a", &ff.audio_codec)
                .opt("-b:a", &ff.audio_bitrate)
                .opt("-ar", ff.sample_rate)
                .opt("-ac", ff.channels)
                .output(&out)
                .build_args()
        };

        if ff.apply_normalization {
            let output = self.executor.run(encode(true)).await.map_err(|e| PipelineError::io(stage, e))?;
            if output.success {
                return Ok(out);
            }
            warn!("Job {}: Loudness normalization failed for chunk {}, encoding as-is", paths.id, index);
        }
        self.transcode(paths, stage, encode(false)).await?;
        Ok(out)
    }

    /// Usable background clips in `dir`, shuffled
    async fn list_candidates(&self, dir: &Path) -> Vec<VideoCandidate> {
        let min_secs = self.config.video.max_segment_secs;
        let allowed: Vec<String> = self.config.video.allowed_extensions.iter().map(|e| e.to_ascii_lowercase()).collect();

        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| allowed.contains(&e.to_ascii_lowercase()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut candidates = Vec::new();
        for path in files {
            match self.probe.inspect(&path).await {
                Ok(info) if info.duration >= min_secs => candidates.push(VideoCandidate {
                    file_path: path,
                    duration: info.duration,
                    info,
                }),
                Ok(info) => debug!("Skipping {} ({:.2}s < {:.2}s)", path.display(), info.duration, min_secs),
                Err(e) => warn!("Skipping unreadable background clip {}: {:#}", path.display(), e),
            }
        }

        {
            let mut rng = rand::thread_rng();
            candidates.shuffle(&mut rng);
        }
        candidates
    }

    /// Exactly `required` candidates; the directory is probed once and the
    /// listing repeated, reshuffled, whenever the pool runs dry
    async fn select_candidates(&self, dir: &Path, required: usize) -> Result<Vec<VideoCandidate>, PipelineError> {
        let listed = self.list_candidates(dir).await;
        if listed.is_empty() {
            return Err(PipelineError::NoBackgroundCandidates {
                dir: dir.to_path_buf(),
                min_secs: self.config.video.max_segment_secs,
            });
        }

        let mut pool = listed.clone();
        while pool.len() < required {
            let mut more = listed.clone();
            {
                let mut rng = rand::thread_rng();
                more.shuffle(&mut rng);
            }
            debug!("Replenishing background pool with {} clip(s)", more.len());
            pool.extend(more);
        }
        pool.truncate(required);
        Ok(pool)
    }

    fn plan_captions(&self, job: &Job, words: &[WordTiming], width: u32, height: u32) -> CaptionPlan {
        let style = {
            let mut rng = rand::thread_rng();
            CaptionStyle::resolve(&self.config.captions, job.video_type, width, height, &mut rng)
        };
        let glyphs = GlyphWidths::measure(&style.font_file, style.font_size as f64);
        let lines = CaptionLayout::new(&glyphs, style.line_budget)
            .with_max_words(style.max_words_per_line)
            .pack(words);
        CaptionPlan { width, height, style, glyphs, lines }
    }

    async fn cleanup(&self, paths: &JobPaths, chunk_count: usize) {
        let mut doomed = vec![
            paths.chunk_list(),
            paths.narration(),
            paths.background_script(),
            paths.background(),
            paths.muxed(),
            paths.captions_script(),
        ];
        for i in 0..chunk_count {
            doomed.push(paths.chunk_samples(i));
            doomed.push(paths.chunk_audio(i));
        }

        for path in doomed {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Job {}: Failed to remove {}: {}", paths.id, path.display(), e),
            }
        }
    }

    /// Run every step for `job`, returning the final artifact path
    ///
    /// A canceled run removes its intermediates; any other failure keeps them
    /// next to the saved stderr.
    pub async fn execute(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        let paths = JobPaths::new(self.store.root(), job, &self.config);
        let mut chunk_count = 0;

        let result = self.assemble(job, &paths, &mut chunk_count).await;
        if let Err(PipelineError::Canceled { stage }) = &result {
            info!("Job {}: 🗑️  Removing intermediates after cancel at {}", job.id, stage);
            self.cleanup(&paths, chunk_count).await;
        }
        result
    }

    async fn assemble(&self, job: &Job, paths: &JobPaths, chunk_count: &mut usize) -> Result<PathBuf, PipelineError> {
        let cfg = &self.config;

        // 1. text
        self.checkpoint(&job.id, Stage::TextReceived)?;
        let text = clean_text(&job.text);
        if text.is_empty() {
            return Err(PipelineError::EmptyText);
        }
        tokio::fs::create_dir_all(&paths.dir)
            .await
            .with_context(|| format!("Failed to create job directory: {}", paths.dir.display()))
            .map_err(|e| PipelineError::io(Stage::TextReceived, e))?;
        self.advance(&job.id, Stage::TextReceived)?;

        // 2. narration and word timings
        let voice = {
            let mut rng = rand::thread_rng();
            resolve_voice(&job.voice, &mut rng)
        };
        info!("Job {}: 🎙️ Synthesizing {} chars with voice {}", job.id, text.len(), voice);
        let synthesized = self
            .synthesizer
            .synthesize(&text, &job.language, &voice, job.speech_rate)
            .await
            .map_err(|e| PipelineError::io(Stage::NarrationSynthesized, e))?;

        let mut chunks = Vec::with_capacity(synthesized.len());
        for (i, chunk) in synthesized.into_iter().enumerate() {
            *chunk_count = i + 1;
            let file_path = self.store_chunk(paths, i, &chunk.samples).await?;
            chunks.push(AudioChunk {
                text: chunk.text,
                phonemes: chunk.phonemes,
                samples: chunk.samples,
                file_path,
            });
        }
        self.advance(&job.id, Stage::NarrationSynthesized)?;
        self.checkpoint(&job.id, Stage::NarrationSynthesized)?;

        let language = cfg
            .transcriber
            .language
            .clone()
            .unwrap_or_else(|| primary_language(&job.language));
        let mut words: Vec<WordTiming> = Vec::new();
        let mut time_offset = 0.0;
        for chunk in &chunks {
            let transcription = self
                .transcriber
                .transcribe(&chunk.file_path, &language)
                .await
                .map_err(|e| PipelineError::io(Stage::Transcribed, e))?;
            let mut chunk_words = transcription.words();
            shift_timings(&mut chunk_words, time_offset);
            debug!("Job {}: {} word(s) in chunk {:?}", job.id, chunk_words.len(), chunk.text);
            words.extend(chunk_words);
            time_offset += transcription.duration;
        }
        if words.is_empty() {
            return Err(PipelineError::NoTranscription);
        }
        self.advance(&job.id, Stage::Transcribed)?;

        let (width, height) = frame_size(cfg, job);
        let mut plan = self.plan_captions(job, &words, width, height);
        info!("Job {}: {} word(s) packed into {} caption line(s)", job.id, words.len(), plan.lines.len());
        self.advance(&job.id, Stage::CaptionsPlanned)?;
        self.checkpoint(&job.id, Stage::CaptionsPlanned)?;

        // 3. narration track
        let stage = Stage::BackgroundAssembled;
        let list = chunks
            .iter()
            .map(|c| format!("file {}\n", escape_concat_path(&c.file_path.display().to_string())))
            .collect::<String>();
        tokio::fs::write(paths.chunk_list(), list)
            .await
            .context("Failed to write chunk list")
            .map_err(|e| PipelineError::io(stage, e))?;
        let merge = FfmpegCommand::new()
            .opt("-f", "concat")
            .opt("-safe", 0)
            .input(paths.chunk_list())
            .opt("-c", "copy")
            .output(paths.narration())
            .build_args();
        self.transcode(paths, stage, merge).await?;

        let narration_secs = self
            .probe
            .duration(&paths.narration())
            .await
            .map_err(|e| PipelineError::io(stage, e))?;
        let segment_secs = cfg.video.max_segment_secs;
        let required = segments_required(narration_secs, segment_secs);
        info!(
            "Job {}: 🎬 Narration is {:.2}s, assembling {} background segment(s) of {}s",
            job.id, narration_secs, required, segment_secs
        );

        // 4. background track
        let background_dir = match job.video_type {
            VideoType::Horizontal => &cfg.video.background_dir,
            VideoType::Vertical => &cfg.video.vertical_background_dir,
        };
        let candidates = self.select_candidates(background_dir, required).await?;

        let mut segments = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let silent = self
                .probe
                .is_silent(&candidate.info, &candidate.file_path, Some(segment_secs))
                .await
                .map_err(|e| PipelineError::io(stage, e))?;
            segments.push(if silent {
                debug!("Using generated silence for {}", candidate.file_path.display());
                SegmentAudio::Silent
            } else {
                SegmentAudio::Source { channels: candidate.info.audio_channels.unwrap_or(2) }
            });
        }

        let format = SegmentFormat {
            width,
            height,
            pixel_format: cfg.ffmpeg.pixel_format.clone(),
            sample_rate: cfg.ffmpeg.sample_rate,
        };
        let graph = background_graph(&segments, segment_secs, &format);
        self.write_script(&paths.background_script(), graph.to_string(), stage).await?;

        let mut assemble = FfmpegCommand::new();
        for candidate in &candidates {
            assemble = assemble.input(&candidate.file_path);
        }
        let assemble = assemble
            .opt("-filter_complex_script", paths.background_script().display())
            .opt("-map", "[outv]")
            .opt("-map", "[outa]")
            .opt("-r", cfg.video.fps)
            .opt("-c:v", &cfg.ffmpeg.video_codec)
            .opt("-c:a", &cfg.ffmpeg.audio_codec)
            .opt("-ar", cfg.ffmpeg.sample_rate)
            .opt("-ac", cfg.ffmpeg.channels)
            .opt("-pix_fmt", &cfg.ffmpeg.pixel_format)
            .opt("-preset", &cfg.ffmpeg.preset)
            .output(paths.background())
            .build_args();
        self.transcode(paths, stage, assemble).await?;
        self.advance(&job.id, stage)?;
        self.checkpoint(&job.id, stage)?;

        // 5. mux
        let stage = Stage::Muxed;
        let mux = FfmpegCommand::new()
            .input(paths.background())
            .input(paths.narration())
            .opt("-c:v", &cfg.ffmpeg.video_codec)
            .opt("-c:a", &cfg.ffmpeg.audio_codec)
            .opt("-map", "0:v:0")
            .opt("-map", "1:a:0")
            .arg("-shortest")
            .opt("-preset", &cfg.ffmpeg.preset)
            .output(paths.muxed())
            .build_args();
        self.transcode(paths, stage, mux).await?;
        self.advance(&job.id, stage)?;

        // 6. captions
        let stage = Stage::CaptionsBurned;
        let muxed = self.probe.inspect(&paths.muxed()).await.map_err(|e| PipelineError::io(stage, e))?;
        if let (Some(w), Some(h)) = (muxed.width, muxed.height) {
            if (w, h) != (plan.width, plan.height) {
                warn!(
                    "Job {}: Muxed video is {}x{}, expected {}x{}; re-planning captions",
                    job.id, w, h, plan.width, plan.height
                );
                plan = self.plan_captions(job, &words, w, h);
            }
        }
        let overlay = build_overlay_expression(&plan.lines, plan.width, &plan.style, &plan.glyphs);
        self.write_script(&paths.captions_script(), overlay.to_string(), stage).await?;
        let burn = FfmpegCommand::new()
            .input(paths.muxed())
            .opt("-filter_complex_script", paths.captions_script().display())
            .opt("-c:v", &cfg.ffmpeg.video_codec)
            .opt("-c:a", &cfg.ffmpeg.audio_codec)
            .opt("-preset", &cfg.ffmpeg.preset)
            .output(paths.final_video())
            .build_args();
        self.transcode(paths, stage, burn).await?;
        self.advance(&job.id, stage)?;

        // 7. cleanup
        self.cleanup(paths, chunks.len()).await;
        self.advance(&job.id, Stage::Cleaned)?;
        self.advance(&job.id, Stage::Done)?;

        Ok(paths.final_video())
    }
}

#[async_trait]
impl JobRunner for MediaAssemblyPipeline {
    async fn run(&self, job: Job) -> Result<PathBuf, PipelineError> {
        self.execute(&job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecOutput;
    use crate::job::JobStatus;
    use crate::probe::{ProbeData, ProbeFormat, ProbeStream};
    use crate::speech::{SynthesizedChunk, TranscriptSegment, Transcription};
    use crate::store::FileJobStore;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn file_name(path: &Path) -> String {
        path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string()
    }

    /// Records every run, creates each output file and answers probes from a
    /// table keyed by file name
    struct FakeExecutor {
        runs: Mutex<Vec<Vec<String>>>,
        scripts: Mutex<Vec<String>>,
        probed: Mutex<Vec<String>>,
        durations: HashMap<String, f64>,
        narration_secs: f64,
        silent: HashSet<String>,
        fail_when: Option<String>,
        frame: (u32, u32),
    }

    impl FakeExecutor {
        fn new(narration_secs: f64) -> Self {
            Self {
                runs: Mutex::new(Vec::new()),
                scripts: Mutex::new(Vec::new()),
                probed: Mutex::new(Vec::new()),
                durations: HashMap::from([
                    ("a.mp4".to_string(), 10.0),
                    ("b.MOV".to_string(), 7.0),
                    ("short.mp4".to_string(), 2.0),
                    ("tall.mp4".to_string(), 9.0),
                ]),
                narration_secs,
                silent: HashSet::from(["b.MOV".to_string()]),
                fail_when: None,
                frame: (1920, 1080),
            }
        }

        fn runs(&self) -> Vec<Vec<String>> {
            self.runs.lock().unwrap().clone()
        }

        fn scripts(&self) -> Vec<String> {
            self.scripts.lock().unwrap().clone()
        }

        fn probe_count(&self, name: &str) -> usize {
            self.probed.lock().unwrap().iter().filter(|p| *p == name).count()
        }
    }

    #[async_trait]
    impl TranscodeExecutor for FakeExecutor {
        async fn run(&self, args: Vec<String>) -> Result<ExecOutput> {
            self.runs.lock().unwrap().push(args.clone());

            if let Some(i) = args.iter().position(|a| a == "-filter_complex_script") {
                let script = std::fs::read_to_string(&args[i + 1])?;
                self.scripts.lock().unwrap().push(script);
            }

            if let Some(marker) = &self.fail_when {
                if args.iter().any(|a| a == marker) {
                    return Ok(ExecOutput {
                        success: false,
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: "Error while processing\nConversion failed!".to_string(),
                    });
                }
            }

            if args.iter().any(|a| a == "volumedetect") {
                let input = args.iter().position(|a| a == "-i").map(|i| args[i + 1].clone()).unwrap_or_default();
                let db = if self.silent.contains(&file_name(Path::new(&input))) { -91.0 } else { -18.5 };
                return Ok(ExecOutput {
                    success: true,
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: format!("[Parsed_volumedetect_0 @ 0x1] mean_volume: {} dB", db),
                });
            }

            if let Some(output) = args.last() {
                std::fs::write(output, b"media")?;
            }
            Ok(ExecOutput { success: true, exit_code: Some(0), ..Default::default() })
        }

        async fn probe(&self, path: &Path) -> Result<ProbeData> {
            let name = file_name(path);
            self.probed.lock().unwrap().push(name.clone());
            let duration = if name.ends_with("_Merged.mp3") {
                self.narration_secs
            } else {
                self.durations.get(&name).copied().unwrap_or(0.0)
            };
            Ok(ProbeData {
                streams: vec![
                    ProbeStream {
                        index: 0,
                        codec_type: Some("video".to_string()),
                        width: Some(self.frame.0),
                        height: Some(self.frame.1),
                        ..Default::default()
                    },
                    ProbeStream {
                        index: 1,
                        codec_type: Some("audio".to_string()),
                        channels: Some(2),
                        ..Default::default()
                    },
                ],
                format: ProbeFormat { format_name: None, duration: Some(duration.to_string()) },
            })
        }
    }

    struct FakeSynthesizer {
        chunks: usize,
        /// Job to flag for cancellation while speech is being produced
        cancel: Option<(Arc<FileJobStore>, String)>,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynthesizer {
        fn sample_rate(&self) -> u32 {
            24000
        }

        async fn synthesize(&self, text: &str, _language: &str, voice: &str, _rate: f32) -> Result<Vec<SynthesizedChunk>> {
            assert_ne!(voice, "random");
            if let Some((store, id)) = &self.cancel {
                store.update(id, &mut |job| job.cancel_requested = true)?;
            }
            Ok((0..self.chunks)
                .map(|_| SynthesizedChunk {
                    text: text.to_string(),
                    phonemes: String::new(),
                    samples: vec![0.0, 0.1, -0.1],
                })
                .collect())
        }
    }

    /// Answers `<id>_<i>.mp3` with the i-th canned transcription
    struct FakeTranscriber {
        per_chunk: Vec<Transcription>,
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, audio: &Path, _language: &str) -> Result<Transcription> {
            let stem = audio.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let index: usize = stem.rsplit('_').next().and_then(|i| i.parse().ok()).unwrap_or(0);
            Ok(self.per_chunk.get(index).cloned().unwrap_or_default())
        }
    }

    fn transcription(duration: f64, words: &[(&str, f64, f64)]) -> Transcription {
        Transcription {
            text: words.iter().map(|w| w.0).collect::<Vec<_>>().join(" "),
            duration,
            segments: vec![TranscriptSegment {
                start: 0.0,
                end: duration,
                text: String::new(),
                words: words.iter().map(|(w, s, e)| WordTiming::new(*w, *s, *e)).collect(),
            }],
        }
    }

    fn two_chunks() -> Vec<Transcription> {
        vec![
            transcription(1.2, &[("Hello", 0.0, 0.5), ("world.", 0.5, 1.1)]),
            transcription(0.8, &[("Again", 0.1, 0.7)]),
        ]
    }

    struct Harness {
        _store_dir: TempDir,
        _clips: TempDir,
        store: Arc<FileJobStore>,
        executor: Arc<FakeExecutor>,
        pipeline: MediaAssemblyPipeline,
        job: Job,
        paths: JobPaths,
    }

    #[derive(Default)]
    struct Options {
        video_type: VideoType,
        cancel_during_synthesis: bool,
    }

    fn harness(executor: FakeExecutor, transcriptions: Vec<Transcription>, text: &str) -> Harness {
        harness_with(executor, transcriptions, text, Options::default())
    }

    fn harness_with(executor: FakeExecutor, transcriptions: Vec<Transcription>, text: &str, options: Options) -> Harness {
        let store_dir = tempfile::tempdir().unwrap();
        let clips = tempfile::tempdir().unwrap();
        for name in ["a.mp4", "b.MOV", "short.mp4", "notes.txt"] {
            std::fs::write(clips.path().join(name), b"clip").unwrap();
        }
        let vertical = clips.path().join("vertical");
        std::fs::create_dir(&vertical).unwrap();
        std::fs::write(vertical.join("tall.mp4"), b"clip").unwrap();

        let mut config = NarratorConfig::default();
        config.store_dir = store_dir.path().to_path_buf();
        config.video.background_dir = clips.path().to_path_buf();
        config.video.vertical_background_dir = vertical;
        config.video.width = 1920;
        config.video.height = 1080;
        config.captions.font_path = clips.path().join("missing.ttf");

        let store = Arc::new(FileJobStore::open(store_dir.path()).unwrap());
        let mut job = Job::new(text, "en-us", "random", 1.0);
        job.status = JobStatus::Processing;
        job.video_type = options.video_type;
        store.set(job.clone()).unwrap();

        let executor = Arc::new(executor);
        let chunks = transcriptions.len().max(1);
        let cancel = options.cancel_during_synthesis.then(|| (store.clone(), job.id.clone()));
        let pipeline = MediaAssemblyPipeline::new(
            Arc::new(config),
            store.clone(),
            executor.clone(),
            Arc::new(FakeSynthesizer { chunks, cancel }),
            Arc::new(FakeTranscriber { per_chunk: transcriptions }),
        );
        let paths = JobPaths::new(store_dir.path(), &job, &pipeline.config);
        Harness { _store_dir: store_dir, _clips: clips, store, executor, pipeline, job, paths }
    }

    #[test]
    fn test_segments_required() {
        assert_eq!(segments_required(12.0, 5.0), 3);
        assert_eq!(segments_required(10.0, 5.0), 2);
        assert_eq!(segments_required(0.3, 5.0), 1);
        assert_eq!(segments_required(0.0, 5.0), 1);
    }

    #[test]
    fn test_frame_size() {
        let config = NarratorConfig::default();
        let mut job = Job::new("x", "en-us", "af_nova", 1.0);
        assert_eq!(frame_size(&config, &job), (3840, 2160));
        job.video_quality = Some("HD".to_string());
        assert_eq!(frame_size(&config, &job), (1280, 720));
        job.video_type = VideoType::Vertical;
        assert_eq!(frame_size(&config, &job), (720, 1280));
    }

    #[tokio::test]
    async fn test_full_run_produces_final_and_cleans_up() {
        let h = harness(FakeExecutor::new(12.0), two_chunks(), "Hello world. Again");

        let final_path = h.pipeline.execute(&h.job).await.unwrap();
        assert_eq!(final_path, h.job.final_path(h.store.root(), "mp4"));
        assert!(final_path.exists());

        for leftover in [
            h.paths.narration(),
            h.paths.background(),
            h.paths.muxed(),
            h.paths.chunk_audio(0),
            h.paths.chunk_samples(1),
            h.paths.chunk_list(),
            h.paths.background_script(),
            h.paths.captions_script(),
        ] {
            assert!(!leftover.exists(), "{} should be cleaned", leftover.display());
        }
        assert!(h.paths.dir.join("job.json").exists());
        assert_eq!(h.store.get(&h.job.id).unwrap().stage.as_deref(), Some("done"));

        let scripts = h.executor.scripts();
        assert_eq!(scripts.len(), 2);
        // 12s of narration at 5s per segment
        assert!(scripts[0].contains("concat=n=3:v=1:a=1[outv][outa]"));
        assert!(scripts[0].contains("[2:v]trim=start=0:end=5"));
        // base and highlight layer for each of the three words
        assert_eq!(scripts[1].matches("drawtext=").count(), 6);
        // second chunk is shifted by the first chunk's duration
        assert!(scripts[1].contains("text='AGAIN'"));
        assert!(scripts[1].contains("enable='between(t\\,1.3\\,1.9)'"));

        let runs = h.executor.runs();
        let mux = runs.iter().find(|r| r.iter().any(|a| a == "-shortest")).unwrap();
        assert!(mux.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a:0"));
        let assemble = runs.iter().find(|r| r.iter().any(|a| a == "[outv]")).unwrap();
        assert_eq!(assemble.iter().filter(|a| *a == "-i").count(), 3);
        assert!(!assemble.iter().any(|a| a.ends_with("short.mp4") || a.ends_with("notes.txt")));
    }

    #[tokio::test]
    async fn test_silent_clip_gets_generated_audio() {
        let mut executor = FakeExecutor::new(4.0);
        executor.durations.remove("a.mp4");
        let h = harness(executor, two_chunks(), "Hello world. Again");

        h.pipeline.execute(&h.job).await.unwrap();
        let scripts = h.executor.scripts();
        assert!(scripts[0].contains("aevalsrc=0|0:d=5:s=44100,pan=stereo|c0=c0|c1=c1[a0]"));
        assert!(!scripts[0].contains("[0:a]"));
    }

    #[tokio::test]
    async fn test_tool_failure_keeps_intermediates() {
        let mut executor = FakeExecutor::new(6.0);
        executor.fail_when = Some("-shortest".to_string());
        let h = harness(executor, two_chunks(), "Hello world. Again");

        let err = h.pipeline.execute(&h.job).await.unwrap_err();
        match &err {
            PipelineError::Tool { stage, exit_code, stderr_log } => {
                assert_eq!(*stage, Stage::Muxed);
                assert_eq!(*exit_code, Some(1));
                assert_eq!(stderr_log, &h.paths.stderr_log(Stage::Muxed));
                assert!(std::fs::read_to_string(stderr_log).unwrap().contains("Conversion failed!"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(h.paths.background().exists());
        assert!(h.paths.narration().exists());
        assert!(!h.paths.final_video().exists());
        assert_eq!(h.store.get(&h.job.id).unwrap().stage.as_deref(), Some("background_assembled"));
    }

    #[tokio::test]
    async fn test_cancel_at_entry_runs_nothing() {
        let h = harness(FakeExecutor::new(6.0), two_chunks(), "Hello");
        h.store.update(&h.job.id, &mut |j| j.cancel_requested = true).unwrap();

        let err = h.pipeline.execute(&h.job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Canceled { stage: Stage::TextReceived }));
        assert!(h.executor.runs().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_synthesis_stops_and_cleans_up() {
        let options = Options { cancel_during_synthesis: true, ..Options::default() };
        let h = harness_with(FakeExecutor::new(6.0), two_chunks(), "Hello world. Again", options);

        let err = h.pipeline.execute(&h.job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Canceled { stage: Stage::NarrationSynthesized }));

        // only the two chunk encodes ran; nothing after the checkpoint
        let runs = h.executor.runs();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.iter().any(|a| a == "f32le")));
        assert!(h.executor.scripts().is_empty());
        assert_eq!(h.executor.probe_count(&file_name(&h.paths.narration())), 0);

        for i in 0..2 {
            assert!(!h.paths.chunk_samples(i).exists());
            assert!(!h.paths.chunk_audio(i).exists());
        }
        assert!(h.paths.dir.join("job.json").exists());
        assert_eq!(h.store.get(&h.job.id).unwrap().stage.as_deref(), Some("narration_synthesized"));
    }

    #[tokio::test]
    async fn test_vertical_job_uses_vertical_clips() {
        let mut executor = FakeExecutor::new(6.0);
        executor.frame = (1080, 1920);
        let options = Options { video_type: VideoType::Vertical, ..Options::default() };
        let h = harness_with(executor, two_chunks(), "Hello world. Again", options);

        h.pipeline.execute(&h.job).await.unwrap();
        let runs = h.executor.runs();
        let assemble = runs.iter().find(|r| r.iter().any(|a| a == "[outv]")).unwrap();
        let inputs: Vec<&String> = assemble.windows(2).filter(|w| w[0] == "-i").map(|w| &w[1]).collect();
        // 6s of narration needs two segments from the single vertical clip
        assert_eq!(inputs.len(), 2);
        assert!(inputs.iter().all(|i| i.ends_with("vertical/tall.mp4")));
        assert_eq!(h.executor.probe_count("a.mp4"), 0);
        assert!(h.executor.scripts()[0].contains("scale=1080:1920:force_original_aspect_ratio=decrease"));
    }

    #[tokio::test]
    async fn test_short_pool_is_probed_once() {
        // 32s of narration needs seven segments from two usable clips
        let h = harness(FakeExecutor::new(32.0), two_chunks(), "Hello world. Again");

        h.pipeline.execute(&h.job).await.unwrap();
        let runs = h.executor.runs();
        let assemble = runs.iter().find(|r| r.iter().any(|a| a == "[outv]")).unwrap();
        assert_eq!(assemble.iter().filter(|a| *a == "-i").count(), 7);
        assert_eq!(h.executor.probe_count("a.mp4"), 1);
        assert_eq!(h.executor.probe_count("b.MOV"), 1);
        assert_eq!(h.executor.probe_count("short.mp4"), 1);
    }

    #[tokio::test]
    async fn test_empty_text_fails() {
        let h = harness(FakeExecutor::new(6.0), two_chunks(), "\u{1F600} <> {}");
        let err = h.pipeline.execute(&h.job).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyText));
    }

    #[tokio::test]
    async fn test_no_words_fails() {
        let h = harness(FakeExecutor::new(6.0), vec![transcription(1.0, &[])], "Hello");
        let err = h.pipeline.execute(&h.job).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoTranscription));
        assert_eq!(err.stage(), Stage::Transcribed);
    }

    #[tokio::test]
    async fn test_missing_background_clips_fail() {
        let mut executor = FakeExecutor::new(6.0);
        executor.durations.insert("a.mp4".to_string(), 1.0);
        executor.durations.insert("b.MOV".to_string(), 1.0);
        let h = harness(executor, two_chunks(), "Hello world. Again");

        let err = h.pipeline.execute(&h.job).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoBackgroundCandidates { .. }));
    }

    #[tokio::test]
    async fn test_normalization_failure_falls_back() {
        let mut executor = FakeExecutor::new(6.0);
        executor.fail_when = Some("loudnorm".to_string());
        let h = harness(executor, two_chunks(), "Hello world. Again");

        h.pipeline.execute(&h.job).await.unwrap();
        let runs = h.executor.runs();
        let encodes: Vec<_> = runs.iter().filter(|r| r.iter().any(|a| a == "f32le")).collect();
        assert_eq!(encodes.len(), 4);
        assert!(encodes[0].iter().any(|a| a == "loudnorm"));
        assert!(!encodes[1].iter().any(|a| a == "loudnorm"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        /// Selected segments always cover the narration without a spare one
        #[test]
        fn test_segment_coverage(duration in 0.01f64..3600.0, segment in 0.5f64..30.0) {
            let n = segments_required(duration, segment);
            prop_assert!(n as f64 * segment >= duration);
            prop_assert!(n == 1 || (n - 1) as f64 * segment < duration);
        }
    }
}
