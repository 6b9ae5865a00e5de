//! Fire-and-forget operator notifications.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Topic {
    /// A commitment's store transaction failed.
    CommitmentStoreFailed,
    /// Opening a commitment failed or the open transaction reverted.
    CommitmentOpenFailed,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::CommitmentStoreFailed => write!(f, "commitment_store_failed"),
            Topic::CommitmentOpenFailed => write!(f, "commitment_open_failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Sink for notifications. Must not block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        tracing::warn!(
            topic = %notification.topic,
            payload = %notification.payload,
            "Notification"
        );
    }
}

/// Fans notifications out to any number of in-process receivers.
///
/// Notifications sent while nobody listens are dropped, as are those a slow
/// receiver falls behind on.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        tracing::debug!(topic = %notification.topic, "Broadcasting notification");
        let _ = self.sender.send(notification);
    }
}
