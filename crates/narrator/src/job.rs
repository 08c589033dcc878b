use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// File name of the metadata record inside each job directory
pub const JOB_FILE: &str = "job.json";

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Completed, failed and canceled jobs never change status again on their own
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Output orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoType {
    #[default]
    Horizontal,
    Vertical,
}

impl VideoType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "horizontal" => Some(VideoType::Horizontal),
            "vertical" => Some(VideoType::Vertical),
            _ => None,
        }
    }
}

/// One text-to-video request and its persisted lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub text: String,
    pub language: String,
    pub voice: String,
    pub speech_rate: f32,
    #[serde(default)]
    pub video_quality: Option<String>,
    #[serde(default)]
    pub video_type: VideoType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last pipeline stage reached
    #[serde(default)]
    pub stage: Option<String>,
    /// Free-text diagnostics for failed jobs
    #[serde(default)]
    pub reason: Option<String>,
    /// Final artifact path once completed
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    /// Create a queued job; the id hashes the text together with the creation instant
    pub fn new(
        text: impl Into<String>,
        language: impl Into<String>,
        voice: impl Into<String>,
        speech_rate: f32,
    ) -> Self {
        let text = text.into();
        let created_at = Utc::now();
        Self {
            id: job_id(&text, &created_at),
            status: JobStatus::Queued,
            text,
            language: language.into(),
            voice: voice.into(),
            speech_rate,
            video_quality: None,
            video_type: VideoType::Horizontal,
            created_at,
            started_at: None,
            finished_at: None,
            stage: None,
            reason: None,
            artifact: None,
            cancel_requested: false,
        }
    }

    /// Directory owning every artifact of this job
    pub fn dir(&self, store_dir: &Path) -> PathBuf {
        store_dir.join(&self.id)
    }

    /// Fixed location of the finished video
    pub fn final_path(&self, store_dir: &Path, video_format: &str) -> PathBuf {
        self.dir(store_dir).join(format!("{}_Final.{}", self.id, video_format))
    }
}

/// Hex SHA-256 of the text plus creation timestamp, truncated to 32 chars
pub fn job_id(text: &str, created_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(created_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true).as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

/// Write a job record to `<store_dir>/<id>/job.json`, creating the directory if needed
pub fn save_job(job: &Job, store_dir: &Path) -> Result<()> {
    let dir = job.dir(store_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create job directory: {}", dir.display()))?;

    let json = serde_json::to_string_pretty(job)
        .with_context(|| format!("Failed to serialize job {}", job.id))?;

    // Write to a sibling file and rename so readers never see a torn record
    let path = dir.join(JOB_FILE);
    let tmp = dir.join(format!("{}.tmp", JOB_FILE));
    fs::write(&tmp, json)
        .with_context(|| format!("Failed to write job file: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to replace job file: {}", path.display()))?;

    Ok(())
}

/// Read the record of a single job
pub fn load_job(store_dir: &Path, id: &str) -> Result<Job> {
    let path = store_dir.join(id).join(JOB_FILE);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))
}

/// Load every job record under `store_dir`, oldest first
///
/// Unreadable records are logged and skipped so one corrupt file does not hide the rest.
pub fn load_all_jobs(store_dir: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if !store_dir.exists() {
        return Ok(jobs);
    }

    let entries = fs::read_dir(store_dir)
        .with_context(|| format!("Failed to read job store: {}", store_dir.display()))?;

    for entry in entries {
        let entry = entry.context("Failed to read job store entry")?;
        let path = entry.path();
        if !path.is_dir() || !path.join(JOB_FILE).exists() {
            continue;
        }
        let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match load_job(store_dir, id) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping unreadable job record {}: {:#}", path.display(), e),
        }
    }

    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(jobs)
}
