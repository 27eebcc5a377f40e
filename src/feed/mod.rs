//! NotificationFeed: live view of one user's notifications.
//!
//! The feed prefers a push listener on the user's notification query and
//! degrades to a single pull when live delivery cannot be established or
//! stops. Every delivery replaces the whole list; the unread count is always
//! derived from the current list.
//!
//! Each `subscribe` / `refetch` starts a new generation. Only deliveries
//! tagged with the current generation are applied, so a listener that was
//! cancelled or superseded can never touch the list again.

pub mod reconciler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::errors::FeedError;
use crate::models::notification::{decode_snapshot, Notification};
use crate::store::{Direction, DocumentStore, Filter, Query, SnapshotStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    /// No user, or the subscription was cancelled.
    Idle,
    /// Waiting for the first result.
    Loading,
    /// Push listener delivering updates.
    Live,
    /// Populated by a one-time pull; no updates until `refetch`.
    Degraded,
}

/// Read-only view of the feed handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub user_id: Option<String>,
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub loading: bool,
    pub status: FeedStatus,
}

impl Default for FeedSnapshot {
    fn default() -> Self {
        Self {
            user_id: None,
            notifications: Vec::new(),
            unread_count: 0,
            loading: false,
            status: FeedStatus::Idle,
        }
    }
}

struct Listener {
    generation: u64,
    task: AbortHandle,
}

struct FeedState {
    user_id: Option<String>,
    notifications: Vec<Notification>,
    loading: bool,
    status: FeedStatus,
    generation: u64,
    listener: Option<Listener>,
}

impl FeedState {
    fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            user_id: self.user_id.clone(),
            notifications: self.notifications.clone(),
            unread_count: self.unread_count(),
            loading: self.loading,
            status: self.status,
        }
    }
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    collection: String,
    limit: Option<usize>,
    state: Mutex<FeedState>,
    changes: watch::Sender<FeedSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FeedState> {
        // State is replaced wholesale under the lock, so a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &FeedState) {
        self.changes.send_replace(state.snapshot());
    }

    /// Cancel whatever is running and open a new generation for `user_id`.
    fn begin(&self, user_id: Option<String>) -> u64 {
        let mut state = self.lock();
        if let Some(listener) = state.listener.take() {
            listener.task.abort();
            debug!(generation = listener.generation, "cancelled previous notification listener");
        }
        state.generation += 1;

        if state.user_id != user_id {
            state.notifications.clear();
        }
        if user_id.is_some() {
            state.loading = true;
            state.status = FeedStatus::Loading;
        } else {
            state.notifications.clear();
            state.loading = false;
            state.status = FeedStatus::Idle;
        }
        state.user_id = user_id;
        self.publish(&state);
        state.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Replace the list if `generation` is still current. Returns false for stale deliveries.
    fn apply(&self, generation: u64, notifications: Vec<Notification>, status: FeedStatus) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(
                generation,
                current = state.generation,
                "discarding notification delivery from superseded subscription"
            );
            return false;
        }
        state.notifications = notifications;
        state.loading = false;
        state.status = status;
        self.publish(&state);
        true
    }

    fn register(&self, generation: u64, task: AbortHandle) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state.listener = Some(Listener { generation, task });
        true
    }

    /// Forget the listener slot once its task has finished on its own.
    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.listener.as_ref().map(|l| l.generation) == Some(generation) {
            state.listener = None;
        }
    }

    fn cancel(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if let Some(listener) = state.listener.take() {
            listener.task.abort();
        }
        state.generation += 1;
        state.loading = false;
        state.status = FeedStatus::Idle;
        self.publish(&state);
        debug!(generation, "notification subscription cancelled");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listener) = state.listener.take() {
            listener.task.abort();
        }
    }
}

/// Cancellation handle returned by [`NotificationFeed::subscribe`].
///
/// Cancelling is synchronous and idempotent. Handles from superseded
/// subscriptions, and from subscriptions that fell back to a one-time pull,
/// cancel nothing.
pub struct SubscriptionHandle {
    target: Option<(u64, Weak<Shared>)>,
    cancelled: AtomicBool,
}

impl SubscriptionHandle {
    fn inert() -> Self {
        Self {
            target: None,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Whether this handle controls a push listener.
    pub fn is_live(&self) -> bool {
        self.target.is_some()
    }

    pub fn cancel(&self) {
        let Some((generation, shared)) = &self.target else {
            return;
        };
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = shared.upgrade() {
            shared.cancel(*generation);
        }
    }
}

#[derive(Clone)]
pub struct NotificationFeed {
    shared: Arc<Shared>,
}

impl NotificationFeed {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self::with_limit(store, collection, None)
    }

    pub fn with_limit(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        limit: Option<usize>,
    ) -> Self {
        let (changes, _) = watch::channel(FeedSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                store,
                collection: collection.into(),
                limit,
                state: Mutex::new(FeedState {
                    user_id: None,
                    notifications: Vec::new(),
                    loading: false,
                    status: FeedStatus::Idle,
                    generation: 0,
                    listener: None,
                }),
                changes,
            }),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.shared.store
    }

    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    /// The user's notifications, newest first.
    pub fn query_for(&self, user_id: &str) -> Query {
        Query::new(self.shared.collection.clone())
            .filter(Filter::eq("userId", user_id))
            .order_by("createdAt", Direction::Desc)
            .limit(self.shared.limit)
    }

    /// Start delivering notifications for `user_id`, replacing any previous
    /// subscription. `None` resets the feed to an empty, idle state.
    ///
    /// Never fails: an unavailable listener falls back to one pull, and a
    /// failed pull leaves an empty feed.
    pub async fn subscribe(&self, user_id: Option<String>) -> SubscriptionHandle {
        let generation = self.shared.begin(user_id.clone());
        let Some(user_id) = user_id else {
            return SubscriptionHandle::inert();
        };
        let query = self.query_for(&user_id);

        match self.shared.store.listen(&query).await {
            Ok(stream) => {
                if !self.shared.is_current(generation) {
                    debug!(user_id = %user_id, generation, "subscription superseded while connecting");
                    return SubscriptionHandle::inert();
                }

                let task = tokio::spawn(run_listener(
                    Arc::downgrade(&self.shared),
                    generation,
                    query,
                    stream,
                    user_id.clone(),
                ));
                if !self.shared.register(generation, task.abort_handle()) {
                    task.abort();
                    return SubscriptionHandle::inert();
                }

                debug!(user_id = %user_id, generation, "live notification listener registered");
                SubscriptionHandle {
                    target: Some((generation, Arc::downgrade(&self.shared))),
                    cancelled: AtomicBool::new(false),
                }
            }
            Err(e) => {
                let err = FeedError::SubscriptionUnavailable(e);
                warn!(user_id = %user_id, error = %err, "falling back to one-time fetch");
                pull(&self.shared, generation, &query, &user_id).await;
                SubscriptionHandle::inert()
            }
        }
    }

    /// Re-run `subscribe` for the current user, superseding the active subscription.
    pub async fn refetch(&self) -> SubscriptionHandle {
        let user_id = self.shared.lock().user_id.clone();
        self.subscribe(user_id).await
    }

    /// Cancel the active subscription, whichever handle it belongs to.
    pub fn stop(&self) {
        let generation = self.shared.lock().generation;
        self.shared.cancel(generation);
    }

    pub fn current_unread_count(&self) -> usize {
        self.shared.lock().unread_count()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.shared.lock().notifications.clone()
    }

    pub fn status(&self) -> FeedStatus {
        self.shared.lock().status
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().loading
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.shared.lock().snapshot()
    }

    /// Receiver that observes every state change of the feed.
    pub fn watch(&self) -> watch::Receiver<FeedSnapshot> {
        self.shared.changes.subscribe()
    }

    /// Wait until the feed is no longer loading.
    pub async fn settled(&self) -> FeedSnapshot {
        let mut rx = self.watch();
        let settled = rx.wait_for(|s| !s.loading).await.map(|s| s.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }

    /// Like [`settled`](Self::settled), but gives up after `limit` and
    /// returns whatever the feed holds at that point (possibly still loading).
    pub async fn settled_within(&self, limit: Duration) -> FeedSnapshot {
        match tokio::time::timeout(limit, self.settled()).await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                let snapshot = self.snapshot();
                warn!(
                    user_id = ?snapshot.user_id,
                    waited_secs = limit.as_secs_f64(),
                    "no notification delivery yet, showing current view"
                );
                snapshot
            }
        }
    }
}

async fn run_listener(
    shared: Weak<Shared>,
    generation: u64,
    query: Query,
    mut stream: SnapshotStream,
    user_id: String,
) {
    while let Some(item) = stream.next().await {
        let Some(feed) = shared.upgrade() else {
            return;
        };
        match item {
            Ok(docs) => {
                let notifications = decode_snapshot(&docs);
                debug!(user_id = %user_id, count = notifications.len(), "notification snapshot received");
                if !feed.apply(generation, notifications, FeedStatus::Live) {
                    return;
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "live notification listener failed");
                break;
            }
        }
    }
    drop(stream);

    let Some(feed) = shared.upgrade() else {
        return;
    };
    if !feed.is_current(generation) {
        return;
    }
    warn!(user_id = %user_id, "live notifications ended, falling back to one-time fetch");
    pull(&feed, generation, &query, &user_id).await;
    feed.release(generation);
}

async fn pull(shared: &Shared, generation: u64, query: &Query, user_id: &str) {
    match shared.store.fetch_once(query).await {
        Ok(docs) => {
            let notifications = decode_snapshot(&docs);
            debug!(user_id, count = notifications.len(), "fetched notifications once");
            shared.apply(generation, notifications, FeedStatus::Degraded);
        }
        Err(e) => {
            let err = FeedError::FetchFailed(e);
            error!(user_id, error = %err, "error fetching notifications");
            shared.apply(generation, Vec::new(), FeedStatus::Degraded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::notification::{NotificationDraft, NotificationKind};
    use crate::store::memory::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    fn seed(store: &MemoryStore, id: &str, user: &str, minutes: i64, read: bool) {
        let at = Utc.with_ymd_and_hms(2024, 9, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes);
        let mut fields = NotificationDraft::new(user, NotificationKind::Reply, format!("reply {}", id)).to_fields(at);
        fields["read"] = serde_json::Value::Bool(read);
        store.insert_with_id("notifications", id, fields);
    }

    #[tokio::test]
    async fn test_unauthenticated_is_idle_and_empty() {
        let store = MemoryStore::new();
        seed(&store, "n1", "u1", 0, false);
        let feed = NotificationFeed::new(Arc::new(store), "notifications");

        let handle = feed.subscribe(None).await;
        assert!(!handle.is_live());
        let snap = feed.snapshot();
        assert!(snap.notifications.is_empty());
        assert_eq!(snap.unread_count, 0);
        assert!(!snap.loading);
        assert_eq!(snap.status, FeedStatus::Idle);
    }

    #[tokio::test]
    async fn test_live_feed_orders_newest_first() {
        let store = MemoryStore::new();
        seed(&store, "n1", "u1", 0, false);
        seed(&store, "n2", "u1", 5, false);
        seed(&store, "other", "u2", 10, false);
        let feed = NotificationFeed::new(Arc::new(store), "notifications");

        let handle = feed.subscribe(Some("u1".into())).await;
        assert!(handle.is_live());
        let snap = feed.settled().await;
        let ids: Vec<_> = snap.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
        assert_eq!(snap.unread_count, 2);
        assert_eq!(snap.status, FeedStatus::Live);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_limit_applies_to_query() {
        let store = MemoryStore::without_live_updates();
        for i in 0..5 {
            seed(&store, &format!("n{}", i), "u1", i, false);
        }
        let feed = NotificationFeed::with_limit(Arc::new(store), "notifications", Some(3));
        feed.subscribe(Some("u1".into())).await;
        let ids: Vec<_> = feed.notifications().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n4", "n3", "n2"]);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_returns_to_idle() {
        let store = MemoryStore::new();
        seed(&store, "n1", "u1", 0, false);
        let feed = NotificationFeed::new(Arc::new(store), "notifications");

        let handle = feed.subscribe(Some("u1".into())).await;
        feed.settled().await;
        handle.cancel();
        handle.cancel();
        assert_eq!(feed.status(), FeedStatus::Idle);
        assert_eq!(feed.notifications().len(), 1, "last list is kept as a stale view");
    }

    #[tokio::test]
    async fn test_superseded_handle_does_not_cancel_newer_subscription() {
        let store = MemoryStore::new();
        seed(&store, "n1", "u1", 0, false);
        let feed = NotificationFeed::new(Arc::new(store), "notifications");

        let old = feed.subscribe(Some("u1".into())).await;
        let new = feed.refetch().await;
        feed.settled().await;

        old.cancel();
        assert_eq!(feed.status(), FeedStatus::Live);
        new.cancel();
        assert_eq!(feed.status(), FeedStatus::Idle);
    }
}
