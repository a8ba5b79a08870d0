//! In-process fan-out of terminal job notifications
//!
//! Backends publish one [`JobNotification`] per job that reaches a terminal
//! state. The PostgreSQL backend feeds the hub from a `LISTEN` connection so
//! that completions produced by other processes reach local waiters too.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::error::QueueError;
use super::job::JobStatus;
use super::JobQueue;

/// Channel used for `NOTIFY` on PostgreSQL
pub const NOTIFY_CHANNEL: &str = "crawlq_job_done";

const DEFAULT_CAPACITY: usize = 1024;

/// A job reached a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobNotification {
    pub id: Uuid,
    pub status: JobStatus,
}

impl JobNotification {
    /// Wire form: `<uuid>:<status>`
    pub fn to_payload(&self) -> String {
        format!("{}:{}", self.id, self.status)
    }

    pub fn parse(payload: &str) -> Option<Self> {
        let (id, status) = payload.split_once(':')?;
        Some(Self {
            id: Uuid::parse_str(id).ok()?,
            status: status.parse().ok()?,
        })
    }
}

/// Broadcast hub shared by a queue backend and its waiters
#[derive(Debug, Clone)]
pub struct JobNotifications {
    sender: broadcast::Sender<JobNotification>,
}

impl Default for JobNotifications {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl JobNotifications {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, notification: JobNotification) {
        // No receivers is the common case
        let _ = self.sender.send(notification);
    }

    /// Publish a raw `NOTIFY` payload, ignoring malformed ones
    pub fn publish_payload(&self, payload: &str) {
        match JobNotification::parse(payload) {
            Some(notification) => self.publish(notification),
            None => debug!(payload = %payload, "Ignoring malformed job notification"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.sender.subscribe()
    }
}

/// Resolve once `id` is terminal, subscribing before reading the row so a
/// completion landing between the two is never missed
pub(crate) async fn wait_for_terminal<Q>(
    queue: &Q,
    id: Uuid,
    timeout: Duration,
) -> Result<JobStatus, QueueError>
where
    Q: JobQueue + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut receiver = queue.notifications().subscribe();

    if let Some(status) = terminal_status(queue, id).await? {
        return Ok(status);
    }

    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Err(_) => {
                return Err(QueueError::TimedOut {
                    id,
                    waited: timeout,
                })
            }
            Ok(Ok(notification)) => {
                if notification.id == id && notification.status.is_terminal() {
                    return Ok(notification.status);
                }
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                debug!(job_id = %id, skipped, "Notification receiver lagged, re-reading job");
                if let Some(status) = terminal_status(queue, id).await? {
                    return Ok(status);
                }
            }
            Ok(Err(RecvError::Closed)) => return Err(QueueError::NotificationsClosed),
        }
    }
}

async fn terminal_status<Q>(queue: &Q, id: Uuid) -> Result<Option<JobStatus>, QueueError>
where
    Q: JobQueue + ?Sized,
{
    Ok(queue
        .get_job(id)
        .await?
        .map(|job| job.status)
        .filter(JobStatus::is_terminal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let notification = JobNotification {
            id: Uuid::new_v4(),
            status: JobStatus::Failed,
        };
        let parsed = JobNotification::parse(&notification.to_payload()).unwrap();
        assert_eq!(parsed, notification);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(JobNotification::parse("").is_none());
        assert!(JobNotification::parse("abc:completed").is_none());
        assert!(JobNotification::parse(&format!("{}:done", Uuid::nil())).is_none());
    }

    #[tokio::test]
    async fn test_subscribers_receive_published() {
        let hub = JobNotifications::default();
        let mut rx = hub.subscribe();
        let id = Uuid::new_v4();
        hub.publish_payload(&format!("{id}:completed"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, id);
        assert_eq!(got.status, JobStatus::Completed);
    }
}
