//! Read-state transitions for inbox notifications.
//!
//! The reconciler never edits the feed's list. It writes `read = true` to the
//! store and asks the feed to refetch, so the list only ever reflects what
//! the store accepted.

use futures::future::join_all;
use tracing::{info, warn};

use super::NotificationFeed;
use crate::errors::FeedError;
use crate::models::notification::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkRead {
    Marked,
    /// Already read; nothing was written.
    AlreadyRead,
}

#[derive(Debug)]
pub struct FailedUpdate {
    pub id: String,
    pub error: FeedError,
}

/// Outcome of a bulk mark-as-read.
#[derive(Debug, Default)]
pub struct MarkAllReport {
    pub marked: Vec<String>,
    pub failed: Vec<FailedUpdate>,
}

impl MarkAllReport {
    /// Nothing was unread, so nothing was written or refetched.
    pub fn is_noop(&self) -> bool {
        self.marked.is_empty() && self.failed.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct ReadStateReconciler {
    feed: NotificationFeed,
}

impl ReadStateReconciler {
    pub fn new(feed: NotificationFeed) -> Self {
        Self { feed }
    }

    /// Mark one notification read, then refresh the feed.
    ///
    /// A failed write is returned as [`FeedError::UpdateFailed`] and the feed
    /// is left untouched.
    pub async fn mark_read(&self, notification: &Notification) -> Result<MarkRead, FeedError> {
        if notification.read {
            return Ok(MarkRead::AlreadyRead);
        }

        self.feed
            .store()
            .update_document(self.feed.collection(), &notification.id, read_patch())
            .await
            .map_err(|source| FeedError::UpdateFailed {
                id: notification.id.clone(),
                source,
            })?;

        self.feed.refetch().await;
        Ok(MarkRead::Marked)
    }

    /// Mark every unread entry of `notifications` read.
    ///
    /// Updates run concurrently and are best-effort: failures are logged and
    /// reported, successful writes stay, and the feed is refetched once.
    pub async fn mark_all_read(&self, notifications: &[Notification]) -> MarkAllReport {
        let unread: Vec<&Notification> = notifications.iter().filter(|n| !n.read).collect();
        if unread.is_empty() {
            return MarkAllReport::default();
        }

        let store = self.feed.store();
        let collection = self.feed.collection();
        let results = join_all(unread.iter().map(|n| async move {
            let result = store.update_document(collection, &n.id, read_patch()).await;
            (n.id.clone(), result)
        }))
        .await;

        let mut report = MarkAllReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.marked.push(id),
                Err(source) => {
                    let error = FeedError::UpdateFailed { id: id.clone(), source };
                    warn!(notification_id = %id, error = %error, "error marking notification as read");
                    report.failed.push(FailedUpdate { id, error });
                }
            }
        }

        info!(
            marked = report.marked.len(),
            failed = report.failed.len(),
            "bulk mark-as-read finished"
        );

        self.feed.refetch().await;
        report
    }
}

fn read_patch() -> serde_json::Value {
    serde_json::json!({ "read": true })
}
