//! Job executor: the sequential worker loop and the render pipeline it runs.

use futures::join;
use log::{error, info, warn};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::job::{JobPayload, JobStatus, JobUpdate};
use crate::queue::JobQueue;
use crate::rendering::{Deadline, Renderer, SurfaceLauncher};
use crate::resolve::cache::is_cache_file_name;
use crate::resolve::{Resolution, ResourceRole, Resolver};
use crate::store::JobStore;
use crate::template::Compositor;
use crate::{Error, Result, Viewport, WorkerConfig};

/// What a successful render produced
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub file_name: String,
    pub path: PathBuf,
    pub url: Option<String>,
    /// Inputs that could not be fetched and may be missing from the image
    pub degraded: Vec<ResourceRole>,
}

/// Resolve → compose → capture for one job
pub struct Pipeline {
    resolver: Resolver,
    compositor: Compositor,
    renderer: Renderer,
    output_dir: PathBuf,
    public_base_url: Option<String>,
    viewport: Viewport,
}

impl Pipeline {
    pub fn new(
        resolver: Resolver,
        compositor: Compositor,
        renderer: Renderer,
        output_dir: PathBuf,
        public_base_url: Option<String>,
    ) -> Self {
        let viewport = compositor.viewport();
        Self {
            resolver,
            compositor,
            renderer,
            output_dir,
            public_base_url,
            viewport,
        }
    }

    pub fn from_config(config: &WorkerConfig, launcher: Arc<dyn SurfaceLauncher>) -> Result<Self> {
        config.validate()?;
        let resolver = Resolver::new(config.resolver_config())?;
        let compositor = match &config.branding_path {
            Some(path) => Compositor::with_branding_file(path, config.viewport)?,
            None => Compositor::new(config.viewport),
        };
        let renderer = Renderer::new(launcher, config.capture_options())?;
        Ok(Self::new(
            resolver,
            compositor,
            renderer,
            absolute_output_dir(config)?,
            config.public_base_url.clone(),
        ))
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub async fn render(&self, payload: &JobPayload) -> Result<RenderOutput> {
        self.render_by(payload, None).await
    }

    /// Render, failing with `DeadlineExceeded` once `deadline` passes. Returns
    /// only after the rendering surface has been released.
    pub async fn render_by(
        &self,
        payload: &JobPayload,
        deadline: Option<Deadline>,
    ) -> Result<RenderOutput> {
        validate_payload(payload)?;
        let id = payload.id.as_str();

        let resolving = async {
            join!(
                self.resolver
                    .resolve(id, payload.background_url.as_deref(), ResourceRole::Background),
                self.resolver
                    .resolve(id, payload.news_image_url.as_deref(), ResourceRole::News)
            )
        };
        // Resolution is plain async I/O and safe to abandon midway.
        let (background, news) = match deadline {
            Some(d) => tokio::time::timeout_at(d.at().into(), resolving)
                .await
                .map_err(|_| d.exceeded())?,
            None => resolving.await,
        };

        let mut degraded = Vec::new();
        for (role, res) in [(ResourceRole::Background, &background), (ResourceRole::News, &news)] {
            if let Resolution::Degraded { reason, .. } = res {
                warn!("[{}] {} image degraded: {}", id, role.as_str(), reason);
                degraded.push(role);
            }
        }

        let document = self.compositor.compose(&payload.headline, &background, &news);

        let file_name = payload.output_file_name();
        let path = self.output_dir.join(&file_name);
        self.renderer
            .capture_to_file(id, &document, self.viewport, &path, deadline)
            .await?;

        let url = self
            .public_base_url
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), file_name));

        Ok(RenderOutput {
            file_name,
            path,
            url,
            degraded,
        })
    }
}

fn absolute_output_dir(config: &WorkerConfig) -> Result<PathBuf> {
    let dir = if config.output_dir.is_relative() {
        std::env::current_dir()?.join(&config.output_dir)
    } else {
        config.output_dir.clone()
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn validate_payload(payload: &JobPayload) -> Result<()> {
    if payload.headline.trim().is_empty() {
        return Err(Error::InvalidJob("headline is required".into()));
    }
    let id_ok = !payload.id.is_empty()
        && payload
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !id_ok {
        return Err(Error::InvalidJob(format!("unusable job id {:?}", payload.id)));
    }
    // The output shares a directory with cached inputs and must never be
    // mistaken for one by the sweeper.
    if is_cache_file_name(&payload.output_file_name()) {
        return Err(Error::InvalidJob(format!(
            "job id {:?} collides with cache file naming",
            payload.id
        )));
    }
    Ok(())
}

/// Terminal result of processing one delivery
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub id: String,
    pub status: JobStatus,
    pub output: Option<RenderOutput>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub done: usize,
    pub failed: usize,
}

/// Sequential consumer: one job in flight at a time.
pub struct Worker<Q> {
    queue: Q,
    store: Arc<dyn JobStore>,
    pipeline: Pipeline,
    job_timeout: Option<Duration>,
}

impl<Q: JobQueue> Worker<Q> {
    pub fn new(queue: Q, store: Arc<dyn JobStore>, pipeline: Pipeline) -> Self {
        Self {
            queue,
            store,
            pipeline,
            job_timeout: None,
        }
    }

    /// Fail a job that has not finished within `timeout`
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Consume until the queue closes or `shutdown` resolves. A job already in
    /// flight is always finished and acknowledged first.
    pub async fn run<S>(mut self, shutdown: S) -> WorkerStats
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = WorkerStats::default();
        info!("Render worker started");

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                received = self.queue.receive() => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    info!("Queue closed");
                    break;
                }
                Err(e) => {
                    error!("Receiving from queue failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let outcome = self.process(&delivery.payload).await;
            match outcome.status {
                JobStatus::Done => stats.done += 1,
                _ => stats.failed += 1,
            }

            if let Err(e) = self.queue.ack(delivery).await {
                warn!("[{}] acknowledging delivery failed: {}", outcome.id, e);
            }
        }

        info!(
            "Render worker stopped ({} done, {} failed)",
            stats.done, stats.failed
        );
        stats
    }

    /// Run one job through PROCESSING to a terminal state. Never fails;
    /// store outages are logged and the outcome is still returned.
    pub async fn process(&self, payload: &JobPayload) -> JobOutcome {
        let id = payload.id.clone();
        let started = Instant::now();
        info!("[{}] processing", id);

        self.report(&id, JobUpdate::processing()).await;

        let deadline = self.job_timeout.map(Deadline::after);
        let rendered = self.pipeline.render_by(payload, deadline).await;

        match rendered {
            Ok(output) => {
                info!(
                    "[{}] done in {}ms -> {}{}",
                    id,
                    started.elapsed().as_millis(),
                    output.file_name,
                    if output.degraded.is_empty() { "" } else { " (degraded)" }
                );
                self.report(&id, JobUpdate::done(output.file_name.clone(), output.url.clone()))
                    .await;
                JobOutcome {
                    id,
                    status: JobStatus::Done,
                    output: Some(output),
                    error: None,
                }
            }
            Err(e) => {
                let summary = e.summary();
                error!("[{}] failed after {}ms: {}", id, started.elapsed().as_millis(), e);
                self.report(&id, JobUpdate::error(summary.clone())).await;
                JobOutcome {
                    id,
                    status: JobStatus::Error,
                    output: None,
                    error: Some(summary),
                }
            }
        }
    }

    async fn report(&self, id: &str, update: JobUpdate) -> bool {
        let status = update.status;
        match self.store.update(id, update).await {
            Ok(_) => true,
            Err(e) => {
                let failure = Error::ReportFailure {
                    id: id.to_string(),
                    reason: e.to_string(),
                };
                warn!("{} (status {:?} not persisted)", failure, status);
                false
            }
        }
    }
}
