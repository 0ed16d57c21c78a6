//! Rendering engine adapter.
//!
//! A [`SurfaceLauncher`] starts an isolated headless surface; the capture
//! protocol in [`run_capture`] drives it:
//!
//! 1. launch at the exact target size (the only fatal failure point),
//! 2. load the document with a bounded timeout,
//! 3. wait for each image element to be attached *and* decoded with real
//!    dimensions (a bare `load` event also fires for placeholder responses),
//! 4. settle, then capture one PNG at the target size.
//!
//! Load and asset waits that time out are logged and the capture proceeds.
//! The surface is dropped on every path, which tears it down.

pub mod raster;

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::template::Document;
use crate::{Error, Result, Viewport};

#[derive(Debug, Clone)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    pub png_data: Vec<u8>,
}

/// What the surface reports for one image element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Element not in the document (yet)
    Missing,
    /// Attached but not decoded, or decoded with trivial dimensions
    Pending,
    /// Loading finished without usable pixels; waiting longer will not help
    Broken,
    Ready { width: u32, height: u32 },
}

/// A started rendering surface. Dropping it releases all its resources.
pub trait Surface {
    /// Navigate to `url` and wait for the load signal, bounded by `timeout`
    fn load(&mut self, url: &str, timeout: Duration) -> Result<()>;

    fn image_state(&mut self, element_id: &str) -> Result<ImageState>;

    /// Capture a PNG of exactly `viewport` size from the top-left corner
    fn capture_png(&mut self, viewport: Viewport) -> Result<Vec<u8>>;
}

pub trait SurfaceLauncher: Send + Sync {
    /// Start a surface sized exactly to `viewport`
    fn launch(&self, viewport: Viewport) -> Result<Box<dyn Surface>>;
}

/// Overall stop time for one job.
///
/// The blocking capture cannot be cancelled from outside, so it checks the
/// deadline itself between steps and every bounded wait is cut to what is
/// left. The caller always joins the capture thread, which keeps at most one
/// surface alive per worker.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn exceeded(&self) -> Error {
        Error::DeadlineExceeded(self.limit.as_millis() as u64)
    }

    pub fn check(&self) -> Result<()> {
        if self.remaining().is_zero() {
            Err(self.exceeded())
        } else {
            Ok(())
        }
    }
}

/// Timeouts and delays for one capture
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub load_timeout: Duration,
    pub asset_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    /// Where composed documents are written for the surface to load
    pub scratch_dir: PathBuf,
    /// Job deadline; set per capture
    pub deadline: Option<Deadline>,
}

impl CaptureOptions {
    fn check_deadline(&self) -> Result<()> {
        self.deadline.map(|d| d.check()).unwrap_or(Ok(()))
    }

    /// `wait` cut down to whatever the deadline leaves
    fn bounded(&self, wait: Duration) -> Duration {
        match self.deadline {
            Some(d) => wait.min(d.remaining()),
            None => wait,
        }
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            asset_timeout: Duration::from_secs(12),
            poll_interval: Duration::from_millis(150),
            settle_delay: Duration::from_millis(300),
            scratch_dir: std::env::temp_dir().join("newscard"),
            deadline: None,
        }
    }
}

/// Execute the capture protocol against a freshly launched surface.
pub fn run_capture(
    launcher: &dyn SurfaceLauncher,
    document_url: &str,
    image_ids: &[&str],
    viewport: Viewport,
    options: &CaptureOptions,
) -> Result<Screenshot> {
    let mut surface = launcher.launch(viewport).map_err(|e| match e {
        Error::RenderFailure(_) => e,
        other => Error::RenderFailure(other.to_string()),
    })?;
    options.check_deadline()?;

    match surface.load(document_url, options.bounded(options.load_timeout)) {
        Ok(()) => {}
        Err(e @ Error::LoadTimeout(..)) => warn!("{}; capturing partial state", e),
        Err(e) => warn!("Document load reported an error, capturing anyway: {}", e),
    }
    options.check_deadline()?;

    for id in image_ids {
        wait_for_image(surface.as_mut(), id, options);
        options.check_deadline()?;
    }

    std::thread::sleep(options.bounded(options.settle_delay));
    options.check_deadline()?;

    let png = surface.capture_png(viewport)?;
    raster::screenshot_from_png(png, viewport.width, viewport.height)
}

/// Poll until the element is ready or the asset timeout expires.
/// Returns whether the image became ready.
fn wait_for_image(surface: &mut dyn Surface, element_id: &str, options: &CaptureOptions) -> bool {
    let started = Instant::now();
    let asset_timeout = options.bounded(options.asset_timeout);
    loop {
        match surface.image_state(element_id) {
            Ok(ImageState::Ready { width, height }) => {
                debug!("#{} decoded at {}x{}", element_id, width, height);
                return true;
            }
            Ok(ImageState::Broken) => {
                warn!("#{} finished loading without image data", element_id);
                return false;
            }
            Ok(ImageState::Missing) | Ok(ImageState::Pending) => {}
            Err(e) => {
                warn!("Probing #{} failed, not waiting further: {}", element_id, e);
                return false;
            }
        }
        let elapsed = started.elapsed();
        if elapsed >= asset_timeout {
            let timeout = Error::LoadTimeout(asset_timeout.as_millis() as u64, format!("#{}", element_id));
            warn!("{}; continuing without it", timeout);
            return false;
        }
        std::thread::sleep(options.poll_interval.min(asset_timeout - elapsed));
    }
}

/// Composed document written to disk for the lifetime of one capture
struct ScratchDocument {
    path: PathBuf,
}

impl ScratchDocument {
    fn write(dir: &Path, job_id: &str, html: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let safe: String = job_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}-{}.html", safe, uuid::Uuid::new_v4().simple()));
        std::fs::write(&path, html)?;
        Ok(Self { path })
    }

    fn url(&self) -> Result<String> {
        url::Url::from_file_path(&self.path)
            .map(|u| u.to_string())
            .map_err(|_| Error::Render(format!("scratch path {} is not absolute", self.path.display())))
    }
}

impl Drop for ScratchDocument {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Async front of the capture protocol; each capture runs on a blocking
/// thread because surfaces are driven synchronously.
#[derive(Clone)]
pub struct Renderer {
    launcher: Arc<dyn SurfaceLauncher>,
    options: CaptureOptions,
}

impl Renderer {
    pub fn new(launcher: Arc<dyn SurfaceLauncher>, mut options: CaptureOptions) -> Result<Self> {
        if options.scratch_dir.is_relative() {
            options.scratch_dir = std::env::current_dir()?.join(&options.scratch_dir);
        }
        Ok(Self { launcher, options })
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// Run one capture on a blocking thread and wait for it to finish, even
    /// when `deadline` passes; the thread gives up on its own at the next step.
    pub async fn capture(
        &self,
        job_id: &str,
        document: &Document,
        viewport: Viewport,
        deadline: Option<Deadline>,
    ) -> Result<Screenshot> {
        let launcher = self.launcher.clone();
        let mut options = self.options.clone();
        options.deadline = deadline;
        let job_id = job_id.to_string();
        let html = document.html.clone();
        let ids = document.image_element_ids();

        tokio::task::spawn_blocking(move || -> Result<Screenshot> {
            let scratch = ScratchDocument::write(&options.scratch_dir, &job_id, &html)?;
            let url = scratch.url()?;
            let started = Instant::now();
            let shot = run_capture(launcher.as_ref(), &url, &ids, viewport, &options)?;
            info!(
                "[{}] captured {}x{} ({} bytes) in {}ms",
                job_id,
                shot.width,
                shot.height,
                shot.png_data.len(),
                started.elapsed().as_millis()
            );
            Ok(shot)
        })
        .await
        .map_err(|e| Error::Render(format!("capture task failed: {}", e)))?
    }

    /// Capture and write the PNG to `path` (temporary file + rename)
    pub async fn capture_to_file(
        &self,
        job_id: &str,
        document: &Document,
        viewport: Viewport,
        path: &Path,
        deadline: Option<Deadline>,
    ) -> Result<Screenshot> {
        let shot = self.capture(job_id, document, viewport, deadline).await?;
        if let Some(d) = deadline {
            d.check()?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output.png".to_string());
        let tmp = path.with_file_name(format!(".{}.part", file_name));
        tokio::fs::write(&tmp, &shot.png_data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(shot)
    }
}
