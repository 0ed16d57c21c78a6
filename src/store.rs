//! Job store seam and two implementations.
//!
//! The worker only needs `update`; `create`, `get` and `list_recent` exist for
//! the submitting side and for inspection. Both stores enforce the monotonic
//! status lifecycle through [`Job::apply`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::job::{Job, JobUpdate};
use crate::{Error, Result};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<Job>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Apply a partial update and return the updated record
    async fn update(&self, id: &str, update: JobUpdate) -> Result<Job>;

    /// Most recently created jobs first
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>>;
}

// Input is in insertion order; reversing first keeps ties newest-first.
fn newest_first(mut jobs: Vec<Job>, limit: usize) -> Vec<Job> {
    jobs.reverse();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs.truncate(limit);
    jobs
}

/// In-process store, used by tests and single-process setups
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Store(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        job.apply(&update)?;
        Ok(job.clone())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await.values().cloned().collect();
        Ok(newest_first(jobs, limit))
    }
}

/// Store backed by a single JSON file.
///
/// Every mutation rewrites the file through a temporary sibling and a rename
/// so readers in other processes never observe a half-written document.
pub struct FileJobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, b"[]").await?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    async fn load(&self) -> Result<Vec<Job>> {
        let bytes = tokio::fs::read(&self.path).await?;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Store(format!("corrupt store {}: {}", self.path.display(), e)))
    }

    async fn save(&self, jobs: &[Job]) -> Result<()> {
        let data = serde_json::to_vec_pretty(jobs)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: Job) -> Result<Job> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.load().await?;
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(Error::Store(format!("job {} already exists", job.id)));
        }
        jobs.push(job.clone());
        self.save(&jobs).await?;
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().find(|j| j.id == id))
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.load().await?;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        job.apply(&update)?;
        let updated = job.clone();
        self.save(&jobs).await?;
        Ok(updated)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>> {
        let _guard = self.lock.lock().await;
        Ok(newest_first(self.load().await?, limit))
    }
}
