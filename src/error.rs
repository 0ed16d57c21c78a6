//! Error types for the render worker

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the render pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// A resource could not be fetched; the original reference is kept
    #[error("Resolution degraded for {url}: {reason}")]
    ResolutionDegraded { url: String, reason: String },

    /// The rendering surface could not be started at all
    #[error("Render surface failed to start: {0}")]
    RenderFailure(String),

    /// Capture failed after the surface was up
    #[error("Rendering failed: {0}")]
    Render(String),

    /// A bounded wait expired
    #[error("Timed out after {0}ms waiting for {1}")]
    LoadTimeout(u64, String),

    /// A state update did not reach the job store
    #[error("Failed to report job {id}: {reason}")]
    ReportFailure { id: String, reason: String },

    /// The queue transport could not be reached after all attempts
    #[error("Queue connection failed after {attempts} attempts: {reason}")]
    QueueConnectFailure { attempts: u32, reason: String },

    /// Queue transport error after connection
    #[error("Queue error: {0}")]
    Queue(String),

    /// Job store error
    #[error("Job store error: {0}")]
    Store(String),

    /// Unknown job id
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A status update would move a job backwards or out of a terminal state
    #[error("Invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// The job exceeded its overall deadline
    #[error("Job exceeded its deadline of {0}ms")]
    DeadlineExceeded(u64),

    /// Invalid job payload
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short single-line summary suitable for the job record
    pub fn summary(&self) -> String {
        let text = self.to_string();
        let line = text.lines().next().unwrap_or_default().trim();
        if line.chars().count() > 240 {
            let cut: String = line.chars().take(240).collect();
            format!("{}...", cut)
        } else {
            line.to_string()
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}
