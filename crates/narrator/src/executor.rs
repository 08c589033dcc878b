use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::FfmpegSettings;
use crate::probe::ProbeData;

/// Outcome of one transcoder invocation
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Boundary to the external transcoding engine
///
/// `run` reports a non-zero exit through `ExecOutput::success`; `Err` means the
/// process could not be started or awaited at all.
#[async_trait]
pub trait TranscodeExecutor: Send + Sync {
    /// Run the transcoder with an explicit argument list
    async fn run(&self, args: Vec<String>) -> Result<ExecOutput>;

    /// Inspect a media file's container and streams
    async fn probe(&self, path: &Path) -> Result<ProbeData>;
}

/// Executor backed by locally installed ffmpeg/ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegExecutor {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
}

impl FfmpegExecutor {
    pub fn new(settings: &FfmpegSettings) -> Self {
        Self {
            ffmpeg_bin: settings.ffmpeg_bin.clone(),
            ffprobe_bin: settings.ffprobe_bin.clone(),
        }
    }
}

/// Spawn `program` with piped output and drain both streams concurrently
pub(crate) async fn run_captured(program: &Path, args: &[String]) -> Result<ExecOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()
        .with_context(|| format!(
            "Failed to spawn {}. Ensure it is installed and accessible.",
            program.display()
        ))?;

    let stdout = child.stdout.take()
        .ok_or_else(|| anyhow!("Failed to capture stdout of {}", program.display()))?;
    let stderr = child.stderr.take()
        .ok_or_else(|| anyhow!("Failed to capture stderr of {}", program.display()))?;

    // Both pipes must be drained while waiting or a chatty child blocks on a full pipe
    let stdout_handle = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut line_stream = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = line_stream.next_line().await {
            lines.push(line);
        }
        lines.join("\n")
    });

    let stderr_handle = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut line_stream = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = line_stream.next_line().await {
            lines.push(line);
        }
        lines.join("\n")
    });

    let status = child.wait().await
        .with_context(|| format!("Failed to wait for {}", program.display()))?;

    let stdout = stdout_handle.await
        .with_context(|| format!("Failed to read stdout of {}", program.display()))?;
    let stderr = stderr_handle.await
        .with_context(|| format!("Failed to read stderr of {}", program.display()))?;

    Ok(ExecOutput {
        success: status.success(),
        exit_code: status.code(),
        stdout,
        stderr,
    })
}

#[async_trait]
impl TranscodeExecutor for FfmpegExecutor {
    async fn run(&self, args: Vec<String>) -> Result<ExecOutput> {
        let mut full_args = Vec::with_capacity(args.len() + 1);
        full_args.push("-hide_banner".to_string());
        full_args.extend(args);

        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), full_args.join(" "));
        let output = run_captured(&self.ffmpeg_bin, &full_args).await?;
        if !output.success {
            debug!("FFmpeg exited with {:?}", output.exit_code);
        }
        Ok(output)
    }

    async fn probe(&self, path: &Path) -> Result<ProbeData> {
        if !path.exists() {
            return Err(anyhow!("File does not exist: {}", path.display()));
        }

        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            path.display().to_string(),
        ];
        debug!("Executing FFprobe for: {}", path.display());
        let output = run_captured(&self.ffprobe_bin, &args).await?;

        if !output.success {
            return Err(anyhow!(
                "FFprobe failed (exit code {}) for {}:\nSTDERR: {}",
                output.exit_code.unwrap_or(-1),
                path.display(),
                output.stderr
            ));
        }

        serde_json::from_str(&output.stdout)
            .with_context(|| format!("Failed to parse ffprobe JSON for: {}", path.display()))
    }
}

/// Argument-list builder for one ffmpeg invocation with any number of inputs
#[derive(Debug, Clone, Default)]
pub struct FfmpegCommand {
    args: Vec<String>,
    output: Option<PathBuf>,
}

impl FfmpegCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an option and its value
    pub fn opt(self, name: &str, value: impl ToString) -> Self {
        self.arg(name).arg(value.to_string())
    }

    /// Add `-i <path>`; options meant for this input must be added just before
    pub fn input(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().display().to_string();
        self.arg("-i").arg(path)
    }

    /// Set the output file; it is appended last, preceded by `-y`
    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        self.output = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(output) = &self.output {
            args.push("-y".to_string());
            args.push(output.display().to_string());
        }
        args
    }
}
