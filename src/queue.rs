//! Queue transport seam.
//!
//! A queue hands the worker one [`Delivery`] at a time; the worker acknowledges
//! it once the job reached a terminal state (or was given up on). Delivery is
//! at-least-once: a delivery that is never acknowledged may be seen again.

use async_trait::async_trait;
use log::{info, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

use crate::job::JobPayload;
use crate::{Error, Result};

/// A received job plus whatever the transport needs to acknowledge it
#[derive(Debug)]
pub struct Delivery {
    pub payload: JobPayload,
    receipt: Option<PathBuf>,
}

impl Delivery {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            receipt: None,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send {
    /// Wait for the next job. `Ok(None)` means the transport is closed.
    async fn receive(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, delivery: Delivery) -> Result<()>;
}

/// Fixed-delay, bounded-attempt retry used when connecting at startup
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

/// Run `connect` until it succeeds or the policy is exhausted.
///
/// The closure receives the 1-based attempt number. Exhaustion yields
/// [`Error::QueueConnectFailure`] carrying the last error.
pub async fn connect_with_retry<T, F, Fut>(policy: RetryPolicy, mut connect: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_err = String::new();
    for attempt in 1..=attempts {
        match connect(attempt).await {
            Ok(conn) => {
                if attempt > 1 {
                    info!("Queue connected on attempt {}/{}", attempt, attempts);
                }
                return Ok(conn);
            }
            Err(e) => {
                warn!("Queue connect attempt {}/{} failed: {}", attempt, attempts, e);
                last_err = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
    Err(Error::QueueConnectFailure {
        attempts,
        reason: last_err,
    })
}

/// In-process queue over a tokio channel
pub struct MemoryQueue {
    rx: mpsc::Receiver<JobPayload>,
    acked: Arc<Mutex<Vec<String>>>,
}

/// Producer side of a [`MemoryQueue`]
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<JobPayload>,
    acked: Arc<Mutex<Vec<String>>>,
}

impl MemoryQueue {
    pub fn channel(capacity: usize) -> (QueueSender, MemoryQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let acked = Arc::new(Mutex::new(Vec::new()));
        (
            QueueSender {
                tx,
                acked: acked.clone(),
            },
            MemoryQueue { rx, acked },
        )
    }
}

impl QueueSender {
    pub async fn send(&self, payload: JobPayload) -> Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|e| Error::Queue(format!("receiver dropped: {}", e)))
    }

    /// Ids acknowledged so far, in acknowledgement order
    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn receive(&mut self) -> Result<Option<Delivery>> {
        Ok(self.rx.recv().await.map(Delivery::new))
    }

    async fn ack(&mut self, delivery: Delivery) -> Result<()> {
        if let Ok(mut acked) = self.acked.lock() {
            acked.push(delivery.payload.id);
        }
        Ok(())
    }
}

/// Claims older than this are treated as abandoned by a dead worker
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(15 * 60);

/// Directory-backed queue shared by any number of worker processes.
///
/// Layout: `incoming/` holds waiting messages, `claimed/` holds messages a
/// worker has taken but not yet acknowledged. Claiming is a rename, so only
/// one worker wins a message, and stamps the claim's mtime. Connecting moves
/// claims whose lease has run out back into `incoming/`; younger claims
/// belong to a live worker and are left alone. The lease must outlast the
/// longest job.
pub struct SpoolQueue {
    incoming: PathBuf,
    claimed: PathBuf,
    poll_interval: Duration,
    lease: Duration,
}

impl SpoolQueue {
    pub async fn connect(root: impl AsRef<Path>, poll_interval: Duration) -> Result<Self> {
        Self::connect_with_lease(root, poll_interval, DEFAULT_CLAIM_LEASE).await
    }

    pub async fn connect_with_lease(
        root: impl AsRef<Path>,
        poll_interval: Duration,
        lease: Duration,
    ) -> Result<Self> {
        let root = root.as_ref();
        let incoming = root.join("incoming");
        let claimed = root.join("claimed");
        tokio::fs::create_dir_all(&incoming)
            .await
            .map_err(|e| Error::Queue(format!("cannot open spool {}: {}", root.display(), e)))?;
        tokio::fs::create_dir_all(&claimed).await?;

        // A read-only or missing mount fails here, not at first claim.
        let marker = root.join(".writable");
        tokio::fs::write(&marker, b"ok")
            .await
            .map_err(|e| Error::Queue(format!("spool {} is not writable: {}", root.display(), e)))?;
        let _ = tokio::fs::remove_file(&marker).await;

        let queue = Self {
            incoming,
            claimed,
            poll_interval,
            lease,
        };
        let requeued = queue.requeue_expired().await?;
        if requeued > 0 {
            warn!("Requeued {} spool messages with expired claims", requeued);
        }
        Ok(queue)
    }

    /// Write a payload into the spool at `root`
    pub async fn enqueue(root: impl AsRef<Path>, payload: &JobPayload) -> Result<PathBuf> {
        let incoming = root.as_ref().join("incoming");
        tokio::fs::create_dir_all(&incoming).await?;
        let name = format!(
            "{:020}-{}.json",
            chrono::Utc::now().timestamp_micros(),
            sanitize_component(&payload.id)
        );
        let tmp = incoming.join(format!(".{}.tmp", name));
        let dest = incoming.join(&name);
        tokio::fs::write(&tmp, serde_json::to_vec(payload)?).await?;
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(dest)
    }

    async fn requeue_expired(&self) -> Result<usize> {
        let now = SystemTime::now();
        let mut count = 0;
        for name in list_messages(&self.claimed).await? {
            let from = self.claimed.join(&name);
            let claimed_at = match tokio::fs::metadata(&from).await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if now.duration_since(claimed_at).unwrap_or_default() < self.lease {
                continue;
            }
            match tokio::fs::rename(&from, self.incoming.join(&name)).await {
                Ok(()) => count += 1,
                // Acked or requeued by another worker meanwhile.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    async fn try_claim(&self) -> Result<Option<Delivery>> {
        for name in list_messages(&self.incoming).await? {
            let from = self.incoming.join(&name);
            let to = self.claimed.join(&name);
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {}
                // Another worker claimed it first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            // rename keeps the enqueue mtime; the lease runs from the claim.
            stamp_claim(&to).await?;
            let bytes = tokio::fs::read(&to).await?;
            match serde_json::from_slice::<JobPayload>(&bytes) {
                Ok(payload) => {
                    return Ok(Some(Delivery {
                        payload,
                        receipt: Some(to),
                    }))
                }
                Err(e) => {
                    warn!("Dropping malformed spool message {}: {}", name, e);
                    let _ = tokio::fs::remove_file(&to).await;
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn receive(&mut self) -> Result<Option<Delivery>> {
        loop {
            if let Some(delivery) = self.try_claim().await? {
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&mut self, delivery: Delivery) -> Result<()> {
        if let Some(receipt) = delivery.receipt {
            match tokio::fs::remove_file(&receipt).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => warn!(
                    "Claim {} vanished before ack; its lease may be too short",
                    receipt.display()
                ),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

async fn stamp_claim(path: &Path) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await?
        .into_std()
        .await;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

/// Message file names in FIFO order
async fn list_messages(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn sanitize_component(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn payload(id: &str) -> JobPayload {
        JobPayload {
            id: id.to_string(),
            headline: "H".into(),
            background_url: None,
            news_image_url: None,
        }
    }

    #[tokio::test]
    async fn retry_gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        };
        let res: Result<()> = connect_with_retry(policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Queue("down".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match res {
            Err(Error::QueueConnectFailure { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("down"));
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let policy = RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(1),
        };
        let got = connect_with_retry(policy, |attempt| async move {
            if attempt < 3 {
                Err(Error::Queue("not yet".into()))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(got, 3);
    }

    #[tokio::test]
    async fn spool_claims_in_order_and_redelivers_unacked() {
        let dir = tempfile::tempdir().unwrap();
        SpoolQueue::enqueue(dir.path(), &payload("first")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        SpoolQueue::enqueue(dir.path(), &payload("second")).await.unwrap();

        let mut queue = SpoolQueue::connect(dir.path(), Duration::from_millis(10)).await.unwrap();
        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.payload.id, "first");
        queue.ack(first).await.unwrap();

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.payload.id, "second");
        // Not acknowledged: once the lease runs out a reconnect hands it out again.
        drop(second);
        drop(queue);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut queue =
            SpoolQueue::connect_with_lease(dir.path(), Duration::from_millis(10), Duration::from_millis(10))
                .await
                .unwrap();
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.payload.id, "second");
    }

    #[tokio::test]
    async fn live_claims_are_not_stolen_by_a_new_worker() {
        let dir = tempfile::tempdir().unwrap();
        let poll = Duration::from_millis(10);
        SpoolQueue::enqueue(dir.path(), &payload("j1")).await.unwrap();

        let mut worker_a = SpoolQueue::connect(dir.path(), poll).await.unwrap();
        let held = worker_a.receive().await.unwrap().unwrap();
        assert_eq!(held.payload.id, "j1");

        let mut worker_b = SpoolQueue::connect(dir.path(), poll).await.unwrap();
        let stolen = tokio::time::timeout(Duration::from_millis(150), worker_b.receive()).await;
        assert!(stolen.is_err(), "second worker received an in-flight job");

        worker_a.ack(held).await.unwrap();
        let claimed: Vec<_> = std::fs::read_dir(dir.path().join("claimed")).unwrap().collect();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn lease_runs_from_the_claim_not_the_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let poll = Duration::from_millis(10);
        let lease = Duration::from_millis(200);
        SpoolQueue::enqueue(dir.path(), &payload("old")).await.unwrap();
        // Sat in the spool for longer than the lease before anyone claimed it
        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut worker_a = SpoolQueue::connect_with_lease(dir.path(), poll, lease).await.unwrap();
        let held = worker_a.receive().await.unwrap().unwrap();

        let mut worker_b = SpoolQueue::connect_with_lease(dir.path(), poll, lease).await.unwrap();
        let stolen = tokio::time::timeout(Duration::from_millis(50), worker_b.receive()).await;
        assert!(stolen.is_err());
        worker_a.ack(held).await.unwrap();
    }

    #[tokio::test]
    async fn memory_queue_records_acks() {
        let (tx, mut queue) = MemoryQueue::channel(4);
        tx.send(payload("m1")).await.unwrap();
        let d = queue.receive().await.unwrap().unwrap();
        queue.ack(d).await.unwrap();
        assert_eq!(tx.acked(), vec!["m1".to_string()]);

        drop(tx);
        assert!(queue.receive().await.unwrap().is_none());
    }
}
