use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::job::{load_all_jobs, save_job, Job, JobStatus};

/// Outcome of a guarded delete
#[derive(Debug, Clone, PartialEq)]
pub enum Removal {
    /// The job (if it was known) and its directory are gone
    Removed(Option<Job>),
    /// The guard rejected the job; nothing was touched
    Refused(Job),
}

/// Shared job state
///
/// Reads may run concurrently; every write is serialized and lands on disk
/// before the in-memory view changes.
pub trait JobStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Job>;

    /// Insert or replace a job
    fn set(&self, job: Job) -> Result<()>;

    /// Apply `f` to a job under the writer lock and persist the result
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut Job)) -> Result<Option<Job>>;

    /// Remove a job and its directory when `allow` accepts its current state
    ///
    /// The check and the removal happen under the same writer lock.
    fn delete_if(&self, id: &str, allow: &dyn Fn(&Job) -> bool) -> Result<Removal>;

    /// Remove a job and its directory unconditionally
    fn delete(&self, id: &str) -> Result<Option<Job>> {
        match self.delete_if(id, &|_| true)? {
            Removal::Removed(job) => Ok(job),
            Removal::Refused(job) => Ok(Some(job)),
        }
    }

    /// Every job in insertion order
    fn list(&self) -> Vec<Job>;

    /// Directory holding the job directories
    fn root(&self) -> &Path;
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<String, Job>,
    order: Vec<String>,
}

impl StoreInner {
    fn insert(&mut self, job: Job) {
        if !self.jobs.contains_key(&job.id) {
            self.order.push(job.id.clone());
        }
        self.jobs.insert(job.id.clone(), job);
    }
}

/// Job store keeping every record in memory and mirroring it to `<root>/<id>/job.json`
pub struct FileJobStore {
    root: PathBuf,
    inner: RwLock<StoreInner>,
}

impl FileJobStore {
    /// Open the store at `root`, loading every existing record oldest first
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create job store: {}", root.display()))?;

        let mut inner = StoreInner::default();
        for job in load_all_jobs(&root)? {
            inner.insert(job);
        }
        info!("Opened job store {} with {} job(s)", root.display(), inner.order.len());

        Ok(Self { root, inner: RwLock::new(inner) })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreInner>> {
        self.inner.read().map_err(|_| anyhow!("Job store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreInner>> {
        self.inner.write().map_err(|_| anyhow!("Job store lock poisoned"))
    }
}

impl JobStore for FileJobStore {
    fn get(&self, id: &str) -> Option<Job> {
        self.read().ok()?.jobs.get(id).cloned()
    }

    fn set(&self, job: Job) -> Result<()> {
        let mut inner = self.write()?;
        save_job(&job, &self.root)?;
        inner.insert(job);
        Ok(())
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut Job)) -> Result<Option<Job>> {
        let mut inner = self.write()?;
        let Some(current) = inner.jobs.get(id) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        f(&mut updated);
        save_job(&updated, &self.root)?;
        inner.jobs.insert(updated.id.clone(), updated.clone());
        Ok(Some(updated))
    }

    fn delete_if(&self, id: &str, allow: &dyn Fn(&Job) -> bool) -> Result<Removal> {
        let mut inner = self.write()?;
        if let Some(current) = inner.jobs.get(id) {
            if !allow(current) {
                return Ok(Removal::Refused(current.clone()));
            }
        }
        let removed = inner.jobs.remove(id);
        inner.order.retain(|existing| existing != id);

        let dir = self.root.join(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove job directory: {}", dir.display()))?;
        } else if removed.is_some() {
            warn!("Job {}: Directory already gone: {}", id, dir.display());
        }
        Ok(Removal::Removed(removed))
    }

    fn list(&self) -> Vec<Job> {
        match self.read() {
            Ok(inner) => inner.order.iter().filter_map(|id| inner.jobs.get(id).cloned()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Requeue every job a previous process left processing
///
/// A processing job whose cancellation was already requested becomes canceled
/// instead. Returns the number of jobs touched.
pub fn recover_interrupted(store: &dyn JobStore) -> Result<usize> {
    let mut recovered = 0;

    for job in store.list() {
        if job.status != JobStatus::Processing {
            continue;
        }
        store.update(&job.id, &mut |job| {
            if job.cancel_requested {
                job.status = JobStatus::Canceled;
                job.finished_at = Some(chrono::Utc::now());
            } else {
                job.status = JobStatus::Queued;
                job.started_at = None;
            }
        })?;
        if job.cancel_requested {
            info!("Job {}: 🛑 Interrupted while canceling, marked canceled", job.id);
        } else {
            info!("Job {}: 🔄 Interrupted while processing, requeued", job.id);
        }
        recovered += 1;
    }

    Ok(recovered)
}
