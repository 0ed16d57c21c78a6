//! On-disk resource cache.
//!
//! Files live in the shared output directory and are named
//! `{jobId}-{role}-{key}{ext}`. A lookup matches on the `-{role}-{key}` part
//! only, so a file fetched for one job is reused by any later job that
//! references the same source URL. Several worker processes may share the
//! directory; writes go through a hidden temporary file and a rename.

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use super::ResourceRole;
use crate::Result;

/// Stable content key for a source URL: first 16 hex chars of its SHA-256.
pub fn content_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Cache file name for a given job, role, key and extension (with dot)
pub fn cache_file_name(job_id: &str, role: ResourceRole, key: &str, ext: &str) -> String {
    format!("{}-{}-{}{}", job_id, role.as_str(), key, ext)
}

/// Shortest drive file id accepted as a cache key
const MIN_DRIVE_ID_LEN: usize = 25;

/// Whether a file name follows the cache naming scheme exactly:
/// `{jobId}-{bg|news}-{key}.{ext}` where the key is a 16-char content key or
/// a drive file id. Anything else, render outputs included, is not a cache
/// file.
pub fn is_cache_file_name(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    let stem = match name.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < name.len() => &name[..dot],
        _ => return false,
    };
    ResourceRole::ALL.iter().any(|role| {
        let tag = format!("-{}-", role.as_str());
        stem.match_indices(tag.as_str())
            .any(|(at, _)| at > 0 && is_cache_key(&stem[at + tag.len()..]))
    })
}

fn is_cache_key(key: &str) -> bool {
    let content_key = key.len() == 16 && key.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
    let drive_id = key.len() >= MIN_DRIVE_ID_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    content_key || drive_id
}

pub struct ResourceCache {
    dir: PathBuf,
    index: Mutex<HashMap<(ResourceRole, String), PathBuf>>,
}

impl ResourceCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Find a cached file for `(role, key)`, whichever job fetched it.
    pub async fn lookup(&self, role: ResourceRole, key: &str) -> Option<PathBuf> {
        let indexed = self
            .index
            .lock()
            .ok()
            .and_then(|idx| idx.get(&(role, key.to_string())).cloned());
        if let Some(path) = indexed {
            if tokio::fs::metadata(&path).await.is_ok() {
                return Some(path);
            }
            if let Ok(mut idx) = self.index.lock() {
                idx.remove(&(role, key.to_string()));
            }
        }

        // Another process (or an earlier run) may have written it.
        let needle = format!("-{}-{}", role.as_str(), key);
        let mut entries = tokio::fs::read_dir(&self.dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let stem = match name.rfind('.') {
                Some(dot) => &name[..dot],
                None => name.as_str(),
            };
            if stem.ends_with(&needle) {
                let path = entry.path();
                self.remember(role, key, &path);
                return Some(path);
            }
        }
        None
    }

    pub fn remember(&self, role: ResourceRole, key: &str, path: &Path) {
        if let Ok(mut idx) = self.index.lock() {
            idx.insert((role, key.to_string()), path.to_path_buf());
        }
    }

    /// Stream a response body into `file_name` inside the cache directory
    pub async fn store_response(
        &self,
        file_name: &str,
        mut response: reqwest::Response,
    ) -> Result<PathBuf> {
        use tokio::io::AsyncWriteExt;

        tokio::fs::create_dir_all(&self.dir).await?;
        let dest = self.dir.join(file_name);
        let tmp = self.dir.join(format!(".{}.part", file_name));

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut written = 0u64;
        let copy = async {
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<_, crate::Error>(())
        };
        if let Err(e) = copy.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        drop(file);

        tokio::fs::rename(&tmp, &dest).await?;
        debug!("Cached {} ({} bytes)", dest.display(), written);
        Ok(dest)
    }
}

/// Eviction policy for the background cache sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepPolicy {
    /// Remove cache files not modified for this long
    pub max_age: Option<Duration>,
    /// Keep total cache size under this many bytes, evicting oldest first
    pub max_bytes: Option<u64>,
}

impl SweepPolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.max_bytes.is_some()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub bytes_freed: u64,
}

/// Evicts cache files by age and total size. Render outputs are never touched.
pub struct CacheSweeper {
    dir: PathBuf,
    policy: SweepPolicy,
}

impl CacheSweeper {
    pub fn new(dir: impl Into<PathBuf>, policy: SweepPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = SystemTime::now();
        let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_cache_file_name(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            report.scanned += 1;
            let modified = meta.modified().unwrap_or(now);
            files.push((entry.path(), modified, meta.len()));
        }

        // Oldest first.
        files.sort_by(|a, b| a.1.cmp(&b.1));

        let mut keep = Vec::with_capacity(files.len());
        for (path, modified, len) in files {
            let age = now.duration_since(modified).unwrap_or_default();
            let expired = self.policy.max_age.map(|max| age > max).unwrap_or(false);
            if expired {
                self.remove(&path, len, &mut report).await;
            } else {
                keep.push((path, len));
            }
        }

        if let Some(budget) = self.policy.max_bytes {
            let mut total: u64 = keep.iter().map(|(_, len)| *len).sum();
            for (path, len) in keep {
                if total <= budget {
                    break;
                }
                self.remove(&path, len, &mut report).await;
                total = total.saturating_sub(len);
            }
        }

        if report.removed > 0 {
            info!(
                "Cache sweep removed {} of {} files ({} bytes)",
                report.removed, report.scanned, report.bytes_freed
            );
        }
        Ok(report)
    }

    async fn remove(&self, path: &Path, len: u64, report: &mut SweepReport) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                report.removed += 1;
                report.bytes_freed += len;
            }
            Err(e) => warn!("Cache sweep could not remove {}: {}", path.display(), e),
        }
    }

    /// Run `sweep_once` every `interval` until the task is dropped
    pub fn spawn(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    warn!("Cache sweep failed: {}", e);
                }
            }
        })
    }
}
