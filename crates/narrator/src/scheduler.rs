//! Job admission under a concurrency ceiling.
//!
//! The admission task sleeps on a [`Notify`] and only looks at the store when a
//! submission, a finished job or a control command wakes it.

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::PipelineError;
use crate::job::{Job, JobStatus};
use crate::store::{recover_interrupted, JobStore};

/// Executes one admitted job to completion
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> Result<PathBuf, PipelineError>;
}

/// Handle to a running scheduler
pub struct SchedulerHandle {
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the admitter to look for queued jobs
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Shared wake signal for other components
    pub fn notifier(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Stop admitting and abort in-flight jobs
    ///
    /// Aborted jobs stay `processing` on disk and are requeued by the next start.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.join.await.context("Scheduler task failed")
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    max_jobs: usize,
    wake: Arc<Notify>,
}

impl Scheduler {
    /// Recover interrupted jobs and spawn the admission task
    pub fn start(store: Arc<dyn JobStore>, runner: Arc<dyn JobRunner>, max_jobs: usize) -> Result<SchedulerHandle> {
        let recovered = recover_interrupted(&*store).context("Failed to recover interrupted jobs")?;
        if recovered > 0 {
            info!("🔄 Recovered {} interrupted job(s)", recovered);
        }

        let wake = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler {
            store,
            runner,
            max_jobs: max_jobs.max(1),
            wake: wake.clone(),
        };
        let join = tokio::spawn(scheduler.admission_loop(shutdown_rx));
        // pick up whatever is already queued
        wake.notify_one();

        Ok(SchedulerHandle { wake, shutdown, join })
    }

    async fn admission_loop(self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started (max {} concurrent job(s))", self.max_jobs);
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!("❌ Job task ended abnormally: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
            self.admit(&mut running);
        }

        if !running.is_empty() {
            info!("🛑 Scheduler stopping, aborting {} running job(s)", running.len());
        }
        running.shutdown().await;
    }

    /// Start queued jobs, oldest first, until the ceiling is reached
    fn admit(&self, running: &mut JoinSet<()>) {
        let mut jobs = self.store.list();
        let mut processing = jobs.iter().filter(|j| j.status == JobStatus::Processing).count();
        jobs.retain(|j| j.status == JobStatus::Queued);
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        if !jobs.is_empty() {
            debug!("Job status: {} queued, {} processing (max {})", jobs.len(), processing, self.max_jobs);
        }

        for job in jobs {
            if processing >= self.max_jobs {
                debug!("⏸️  {} job(s) processing, waiting for a slot", processing);
                break;
            }

            let started = self.store.update(&job.id, &mut |job| {
                if job.status != JobStatus::Queued {
                    return;
                }
                if job.cancel_requested {
                    job.status = JobStatus::Canceled;
                    job.finished_at = Some(Utc::now());
                } else {
                    job.status = JobStatus::Processing;
                    job.started_at = Some(Utc::now());
                    job.finished_at = None;
                    job.stage = None;
                    job.reason = None;
                }
            });

            let job = match started {
                Ok(Some(job)) if job.status == JobStatus::Processing => job,
                Ok(Some(job)) if job.status == JobStatus::Canceled => {
                    info!("Job {}: 🛑 Canceled before start", job.id);
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("Job {}: ❌ Failed to mark processing: {:#}", job.id, e);
                    continue;
                }
            };

            info!("Job {}: 🎬 Starting ({} chars, voice {})", job.id, job.text.len(), job.voice);
            processing += 1;

            let store = self.store.clone();
            let runner = self.runner.clone();
            let wake = self.wake.clone();
            running.spawn(async move {
                drive(store, runner, job).await;
                wake.notify_one();
            });
        }
    }
}

/// Run a job already marked processing and record its terminal status
///
/// A panicking runner fails the job instead of leaving it processing.
pub async fn drive(store: Arc<dyn JobStore>, runner: Arc<dyn JobRunner>, job: Job) -> Option<Job> {
    let id = job.id.clone();
    let mut task = AbortOnDrop(tokio::spawn(async move { runner.run(job).await }));
    let outcome = match (&mut task.0).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!("Job {}: ❌ Pipeline task panicked: {}", id, e);
            None
        }
    };
    finish(&*store, &id, outcome)
}

/// Record the terminal status of a finished run
fn finish(store: &dyn JobStore, id: &str, outcome: Option<Result<PathBuf, PipelineError>>) -> Option<Job> {
    let updated = store.update(id, &mut |job| {
        job.finished_at = Some(Utc::now());
        match &outcome {
            Some(Ok(artifact)) => {
                job.status = JobStatus::Completed;
                job.artifact = Some(artifact.clone());
                job.reason = None;
            }
            Some(Err(PipelineError::Canceled { stage })) => {
                job.status = JobStatus::Canceled;
                job.reason = Some(format!("canceled after {}", stage));
            }
            Some(Err(e)) => {
                job.status = JobStatus::Failed;
                job.stage = Some(e.stage().to_string());
                job.reason = Some(e.to_string());
            }
            None => {
                job.status = JobStatus::Failed;
                job.reason = Some("pipeline task panicked".to_string());
            }
        }
    });

    match updated {
        Ok(Some(job)) => {
            match job.status {
                JobStatus::Completed => info!(
                    "Job {}: ✅ Completed: {}",
                    id,
                    job.artifact.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
                ),
                JobStatus::Canceled => info!("Job {}: 🛑 Canceled", id),
                _ => error!("Job {}: ❌ Failed: {}", id, job.reason.as_deref().unwrap_or("unknown error")),
            }
            Some(job)
        }
        Ok(None) => {
            warn!("Job {}: Finished but no longer in the store", id);
            None
        }
        Err(e) => {
            error!("Job {}: ❌ Failed to record outcome: {:#}", id, e);
            None
        }
    }
}
