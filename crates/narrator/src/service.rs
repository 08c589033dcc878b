use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use tokio::sync::Notify;

use crate::catalog::{is_supported_language, is_supported_voice};
use crate::config::NarratorConfig;
use crate::error::{StoreError, SubmitError};
use crate::job::{load_job, Job, JobStatus, VideoType};
use crate::store::{JobStore, Removal};
use crate::text::clean_text;

/// Accepted speech rates, inclusive
pub const SPEECH_RATE_RANGE: (f32, f32) = (0.5, 2.0);

fn not_processing(job: &Job) -> bool {
    job.status != JobStatus::Processing
}

/// A text-to-video request before validation
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub text: String,
    pub language: Option<String>,
    pub voice: Option<String>,
    pub speech_rate: Option<String>,
    pub video_quality: Option<String>,
    pub video_type: Option<String>,
}

impl SubmitRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }
}

/// Job counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub max_jobs: usize,
}

impl StatusSummary {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed + self.canceled
    }
}

/// Job operations shared by the daemon and command-line front ends
pub struct JobService {
    store: Arc<dyn JobStore>,
    config: Arc<NarratorConfig>,
    wake: Option<Arc<Notify>>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<NarratorConfig>) -> Self {
        Self { store, config, wake: None }
    }

    /// Wake this notifier whenever a job becomes admissible
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    fn wake(&self) {
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }

    fn existing(&self, id: &str) -> Result<Job, StoreError> {
        self.store.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Check a request and build the queued job it describes
    pub fn validate(&self, request: &SubmitRequest) -> Result<Job, SubmitError> {
        if clean_text(&request.text).is_empty() {
            return Err(SubmitError::EmptyText);
        }
        let len = request.text.chars().count();
        if len > self.config.api.max_text_length {
            return Err(SubmitError::TextTooLong { len, max: self.config.api.max_text_length });
        }

        let language = request.language.clone().unwrap_or_else(|| self.config.tts.language.clone());
        if !is_supported_language(&language) {
            return Err(SubmitError::UnsupportedLanguage(language));
        }

        let voice = request.voice.clone().unwrap_or_else(|| self.config.tts.voice.clone());
        if !is_supported_voice(&voice) {
            return Err(SubmitError::UnsupportedVoice(voice));
        }

        let video_quality = match &request.video_quality {
            Some(name) => match self.config.video.quality(name) {
                Some(preset) => Some(preset.name.clone()),
                None => return Err(SubmitError::UnknownVideoQuality(name.clone())),
            },
            None => None,
        };

        let video_type = match &request.video_type {
            Some(value) => VideoType::parse(value).ok_or_else(|| SubmitError::UnknownVideoType(value.clone()))?,
            None => VideoType::default(),
        };

        let speech_rate = match &request.speech_rate {
            Some(value) => {
                let rate: f32 = value
                    .trim()
                    .parse()
                    .map_err(|_| SubmitError::InvalidSpeechRate(value.clone()))?;
                let (min, max) = SPEECH_RATE_RANGE;
                if !rate.is_finite() || rate < min || rate > max {
                    return Err(SubmitError::InvalidSpeechRate(value.clone()));
                }
                rate
            }
            None => self.config.tts.speech_rate,
        };

        let mut job = Job::new(request.text.clone(), language.to_ascii_lowercase(), voice, speech_rate);
        job.video_quality = video_quality;
        job.video_type = video_type;
        Ok(job)
    }

    /// Validate, persist as queued and wake the scheduler
    pub fn submit(&self, request: &SubmitRequest) -> Result<Job> {
        let job = self.validate(request)?;
        self.store.set(job.clone())?;
        info!("Job {}: Queued ({} chars, {}, {})", job.id, job.text.len(), job.language, job.voice);
        self.wake();
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<Job> {
        self.store.list()
    }

    pub fn status(&self) -> StatusSummary {
        let mut summary = StatusSummary { max_jobs: self.config.api.max_jobs, ..Default::default() };
        for job in self.store.list() {
            match job.status {
                JobStatus::Queued => summary.queued += 1,
                JobStatus::Processing => summary.processing += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Canceled => summary.canceled += 1,
            }
        }
        summary
    }

    /// Whether a processing slot is free
    pub fn ready(&self) -> bool {
        let summary = self.status();
        summary.processing < summary.max_jobs.max(1)
    }

    /// Cancel a queued job at once, or flag a processing one for its next checkpoint
    pub fn cancel(&self, id: &str) -> Result<Job, StoreError> {
        let current = self.existing(id)?;
        if current.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: JobStatus::Canceled,
            });
        }

        let updated = self
            .store
            .update(id, &mut |job| match job.status {
                JobStatus::Queued => {
                    job.status = JobStatus::Canceled;
                    job.finished_at = Some(Utc::now());
                    job.cancel_requested = true;
                }
                JobStatus::Processing => job.cancel_requested = true,
                _ => {}
            })?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        match updated.status {
            JobStatus::Canceled => info!("Job {}: 🛑 Canceled while queued", id),
            _ => info!("Job {}: 🛑 Cancellation requested", id),
        }
        Ok(updated)
    }

    /// Remove a job that is not processing, together with its directory
    pub fn delete(&self, id: &str) -> Result<Job, StoreError> {
        self.existing(id)?;
        match self.store.delete_if(id, &not_processing)? {
            Removal::Removed(Some(removed)) => {
                info!("Job {}: 🗑️  Deleted", id);
                Ok(removed)
            }
            Removal::Removed(None) => Err(StoreError::NotFound(id.to_string())),
            Removal::Refused(_) => Err(StoreError::Busy(id.to_string())),
        }
    }

    /// Delete every job that is not processing; returns how many were removed
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for job in self.store.list() {
            match self.store.delete_if(&job.id, &not_processing)? {
                Removal::Removed(Some(_)) => deleted += 1,
                Removal::Removed(None) => {}
                Removal::Refused(_) => warn!("Job {}: Still processing, not deleted", job.id),
            }
        }
        info!("🗑️  Deleted {} job(s)", deleted);
        Ok(deleted)
    }

    /// Path of the finished video, once it exists and is non-empty
    pub fn result(&self, id: &str) -> Result<PathBuf, StoreError> {
        let job = self.existing(id)?;
        if job.status != JobStatus::Completed {
            return Err(StoreError::NotReady(id.to_string()));
        }
        let path = job
            .artifact
            .clone()
            .unwrap_or_else(|| job.final_path(self.store.root(), &self.config.ffmpeg.video_format));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(path),
            _ => Err(StoreError::NotReady(id.to_string())),
        }
    }

    /// Put failed and canceled jobs back in the queue
    pub fn requeue_remaining(&self) -> Result<usize, StoreError> {
        let mut requeued = 0;
        for job in self.store.list() {
            if !matches!(job.status, JobStatus::Failed | JobStatus::Canceled) {
                continue;
            }
            self.store.update(&job.id, &mut |job| {
                job.status = JobStatus::Queued;
                job.started_at = None;
                job.finished_at = None;
                job.stage = None;
                job.reason = None;
                job.artifact = None;
                job.cancel_requested = false;
            })?;
            info!("Job {}: 🔄 Requeued", job.id);
            requeued += 1;
        }
        if requeued > 0 {
            self.wake();
        }
        Ok(requeued)
    }

    /// Load a record another process wrote into the store directory
    pub fn adopt(&self, id: &str) -> Result<Job, StoreError> {
        if let Some(existing) = self.store.get(id) {
            return Ok(existing);
        }
        let job = load_job(self.store.root(), id).map_err(|_| StoreError::NotFound(id.to_string()))?;
        self.store.set(job.clone())?;
        info!("Job {}: Adopted from disk ({})", job.id, job.status);
        if job.status == JobStatus::Queued {
            self.wake();
        }
        Ok(job)
    }
}
