//! Job records, queue payloads and the status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Lifecycle of a render job.
///
/// `Pending -> Processing -> {Done, Error}`. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Done | JobStatus::Error => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Re-reporting the same non-terminal status is allowed (queue redelivery
    /// reports PROCESSING again).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "DONE" => Ok(JobStatus::Done),
            "ERROR" => Ok(JobStatus::Error),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message carried by the queue transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub id: String,
    pub headline: String,
    #[serde(default)]
    pub background_url: Option<String>,
    #[serde(default)]
    pub news_image_url: Option<String>,
}

impl JobPayload {
    /// Name of the PNG written for this job
    pub fn output_file_name(&self) -> String {
        format!("{}.png", self.id)
    }
}

/// Persistent job record as kept by a job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub headline: String,
    pub background_url: Option<String>,
    pub news_image_url: Option<String>,
    pub status: JobStatus,
    pub output_file_name: Option<String>,
    pub output_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a PENDING job with a fresh id
    pub fn new(
        headline: impl Into<String>,
        background_url: Option<String>,
        news_image_url: Option<String>,
    ) -> Result<Self> {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            headline,
            background_url,
            news_image_url,
        )
    }

    pub fn with_id(
        id: impl Into<String>,
        headline: impl Into<String>,
        background_url: Option<String>,
        news_image_url: Option<String>,
    ) -> Result<Self> {
        let headline = headline.into();
        if headline.trim().is_empty() {
            return Err(Error::InvalidJob("headline is required".into()));
        }
        let now = Utc::now();
        Ok(Self {
            id: id.into(),
            headline,
            background_url: background_url.filter(|u| !u.trim().is_empty()),
            news_image_url: news_image_url.filter(|u| !u.trim().is_empty()),
            status: JobStatus::Pending,
            output_file_name: None,
            output_url: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Payload to enqueue for this job
    pub fn payload(&self) -> JobPayload {
        JobPayload {
            id: self.id.clone(),
            headline: self.headline.clone(),
            background_url: self.background_url.clone(),
            news_image_url: self.news_image_url.clone(),
        }
    }

    /// Apply a partial update, enforcing the monotonic lifecycle.
    ///
    /// Output fields are only kept on DONE and `error` only on ERROR.
    pub fn apply(&mut self, update: &JobUpdate) -> Result<()> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status.to_string(),
                    to: next.to_string(),
                });
            }
            self.status = next;
        } else if self.status.is_terminal() {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: self.status.to_string(),
            });
        }

        match self.status {
            JobStatus::Done => {
                if update.output_file_name.is_some() {
                    self.output_file_name = update.output_file_name.clone();
                }
                if update.output_url.is_some() {
                    self.output_url = update.output_url.clone();
                }
                self.error = None;
            }
            JobStatus::Error => {
                if update.error.is_some() {
                    self.error = update.error.clone();
                }
                self.output_file_name = None;
                self.output_url = None;
            }
            _ => {}
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update of a job record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub output_file_name: Option<String>,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn processing() -> Self {
        Self {
            status: Some(JobStatus::Processing),
            ..Default::default()
        }
    }

    pub fn done(output_file_name: String, output_url: Option<String>) -> Self {
        Self {
            status: Some(JobStatus::Done),
            output_file_name: Some(output_file_name),
            output_url,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Done,
            JobStatus::Error,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("FINISHED".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn empty_headline_is_rejected() {
        assert!(Job::new("   ", None, None).is_err());
    }

    #[test]
    fn blank_urls_are_dropped_at_creation() {
        let job = Job::new("A", Some("".into()), Some("  ".into())).unwrap();
        assert!(job.background_url.is_none());
        assert!(job.news_image_url.is_none());
    }

    #[test]
    fn apply_done_then_error_is_rejected() {
        let mut job = Job::with_id("j1", "A", None, None).unwrap();
        job.apply(&JobUpdate::processing()).unwrap();
        job.apply(&JobUpdate::done("j1.png".into(), None)).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.output_file_name.as_deref(), Some("j1.png"));

        let err = job.apply(&JobUpdate::error("late")).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(job.error.is_none());
    }

    #[test]
    fn payload_uses_camel_case_keys() {
        let json = r#"{"id":"x","headline":"H","backgroundUrl":"","newsImageUrl":"http://a/b.png"}"#;
        let payload: JobPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.background_url.as_deref(), Some(""));
        assert_eq!(payload.news_image_url.as_deref(), Some("http://a/b.png"));
        assert_eq!(payload.output_file_name(), "x.png");

        let minimal: JobPayload = serde_json::from_str(r#"{"id":"y","headline":"H"}"#).unwrap();
        assert!(minimal.background_url.is_none());
    }
}
