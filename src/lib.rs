//! Newscard render worker
//!
//! Turns a job (a headline plus two optional image references) into a
//! branded PNG card. A worker claims one job at a time from a queue, resolves
//! its images (rewriting share links, fetching through a proxy for hosts that
//! serve preview pages, caching bytes on disk), composes a fixed HTML
//! template and captures it in a headless browser.
//!
//! # Features
//!
//! - **CDP Backend** (default): renders through headless Chrome
//! - **Graceful degradation**: a missing image yields a visibly incomplete
//!   card, not a failed job
//! - **Swappable seams**: job store, queue and rendering surface are traits
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "cdp")]
//! # async fn demo() -> newscard::Result<()> {
//! use std::sync::Arc;
//! use newscard::{Pipeline, WorkerConfig, Viewport};
//!
//! let config = WorkerConfig {
//!     viewport: Viewport { width: 1080, height: 1350 },
//!     public_base_url: Some("https://cdn.example.com/cards".into()),
//!     ..Default::default()
//! };
//! let launcher = Arc::new(newscard::cdp::CdpLauncher::default());
//! let pipeline = Pipeline::from_config(&config, launcher)?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod job;
pub mod queue;
pub mod store;

pub mod rendering;
pub mod resolve;
pub mod template;
pub mod worker;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use job::{Job, JobPayload, JobStatus, JobUpdate};
pub use queue::{connect_with_retry, Delivery, JobQueue, MemoryQueue, RetryPolicy, SpoolQueue};
pub use rendering::{CaptureOptions, Deadline, Renderer, Screenshot, Surface, SurfaceLauncher};
pub use resolve::{ProxyConfig, Resolution, ResolverConfig, ResourceRole, Resolver};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use template::{Compositor, Document};
pub use worker::{JobOutcome, Pipeline, RenderOutput, Worker, WorkerStats};

/// Configuration for a render worker
///
/// Defaults are conservative: a portrait 1080x1350 card, a 12 second wait
/// per image, and no overall job deadline.
///
/// # Examples
///
/// ```
/// let cfg = newscard::WorkerConfig::default();
/// assert_eq!(cfg.viewport.width, 1080);
/// assert!(cfg.job_timeout_ms.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Output size of every card
    pub viewport: Viewport,
    /// Shared directory for `{jobId}.png` outputs and cached inputs
    pub output_dir: PathBuf,
    /// Public base URL under which `output_dir` is served
    pub public_base_url: Option<String>,
    /// Base URL the renderer uses for cached inputs; `file://` when unset
    pub asset_base_url: Option<String>,
    /// Branding mark to inline; the bundled mark when unset
    pub branding_path: Option<PathBuf>,
    /// Proxy for hosts that serve preview pages instead of bytes
    pub proxy: Option<ProxyConfig>,
    /// User agent for image fetches
    pub user_agent: String,
    /// Timeout for a single image fetch in milliseconds
    pub fetch_timeout_ms: u64,
    /// Timeout for the document load signal in milliseconds
    pub load_timeout_ms: u64,
    /// Timeout for each image to decode in milliseconds
    pub asset_timeout_ms: u64,
    /// Pause between the last wait and the capture in milliseconds
    pub settle_delay_ms: u64,
    /// Overall per-job deadline in milliseconds (disabled when `None`)
    pub job_timeout_ms: Option<u64>,
    /// Directory for documents handed to the rendering surface
    pub scratch_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            output_dir: PathBuf::from("output"),
            public_base_url: None,
            asset_base_url: None,
            branding_path: None,
            proxy: None,
            user_agent: concat!("newscard/", env!("CARGO_PKG_VERSION")).to_string(),
            fetch_timeout_ms: 20000,
            load_timeout_ms: 30000,
            asset_timeout_ms: 12000,
            settle_delay_ms: 300,
            job_timeout_ms: None,
            scratch_dir: std::env::temp_dir().join("newscard"),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(Error::ConfigError("viewport must be non-empty".into()));
        }
        if self.viewport.width > 8192 || self.viewport.height > 8192 {
            return Err(Error::ConfigError("viewport larger than 8192px".into()));
        }
        for (name, value) in [
            ("public_base_url", &self.public_base_url),
            ("asset_base_url", &self.asset_base_url),
        ] {
            if let Some(v) = value {
                url::Url::parse(v)
                    .map_err(|e| Error::ConfigError(format!("{} {:?}: {}", name, v, e)))?;
            }
        }
        if let Some(proxy) = &self.proxy {
            url::Url::parse(&proxy.url)
                .map_err(|e| Error::ConfigError(format!("proxy url {:?}: {}", proxy.url, e)))?;
        }
        Ok(())
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            cache_dir: self.output_dir.clone(),
            asset_base_url: self.asset_base_url.clone(),
            proxy: self.proxy.clone(),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            load_timeout: Duration::from_millis(self.load_timeout_ms),
            asset_timeout: Duration::from_millis(self.asset_timeout_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            scratch_dir: self.scratch_dir.clone(),
            ..Default::default()
        }
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1350,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.viewport.width, 1080);
        assert_eq!(config.viewport.height, 1350);
        assert_eq!(config.asset_timeout_ms, 12000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = WorkerConfig {
            viewport: Viewport { width: 0, height: 10 },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let config = WorkerConfig {
            public_base_url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_options() {
        let config = WorkerConfig {
            asset_timeout_ms: 500,
            job_timeout_ms: Some(90_000),
            ..Default::default()
        };
        assert_eq!(config.capture_options().asset_timeout, Duration::from_millis(500));
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.resolver_config().cache_dir, PathBuf::from("output"));
    }
}
