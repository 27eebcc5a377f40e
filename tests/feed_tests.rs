//! Behavior of the notification feed and read-state reconciler against a
//! scripted store that records every call and lets the test drive live
//! deliveries by hand.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use studymate::errors::{FeedError, StoreError};
use studymate::feed::reconciler::{MarkRead, ReadStateReconciler};
use studymate::feed::{FeedSnapshot, FeedStatus, NotificationFeed};
use studymate::models::notification::Notification;
use studymate::store::{Document, DocumentStore, Filter, Query, SnapshotStream};

type Delivery = Result<Vec<Document>, StoreError>;

/// Store double: counts calls, fails on demand, and hands out one channel per listener.
#[derive(Default)]
struct ScriptedStore {
    live_unavailable: AtomicBool,
    fetch_fails: AtomicBool,
    listen_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    updates: Mutex<Vec<String>>,
    failing_updates: Mutex<HashSet<String>>,
    fetch_result: Mutex<Vec<Document>>,
    listeners: Mutex<Vec<(String, mpsc::UnboundedSender<Delivery>)>>,
}

impl ScriptedStore {
    fn listen_calls(&self) -> usize {
        self.listen_calls.load(Ordering::SeqCst)
    }

    fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn update_calls(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    fn set_fetch_result(&self, docs: Vec<Document>) {
        *self.fetch_result.lock().unwrap() = docs;
    }

    fn fail_update_for(&self, id: &str) {
        self.failing_updates.lock().unwrap().insert(id.to_string());
    }

    /// Sender of the `index`-th listener ever registered.
    fn listener(&self, index: usize) -> mpsc::UnboundedSender<Delivery> {
        self.listeners.lock().unwrap()[index].1.clone()
    }

    fn latest_listener(&self) -> mpsc::UnboundedSender<Delivery> {
        self.listeners.lock().unwrap().last().unwrap().1.clone()
    }

    fn open_listeners(&self) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }
}

fn user_of(query: &Query) -> String {
    query
        .filters
        .iter()
        .map(|Filter::Eq { field, value }| (field, value))
        .find(|(field, _)| field.as_str() == "userId")
        .and_then(|(_, value)| value.as_str().map(String::from))
        .unwrap_or_default()
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn listen(&self, query: &Query) -> Result<SnapshotStream, StoreError> {
        self.listen_calls.fetch_add(1, Ordering::SeqCst);
        if self.live_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::SubscriptionUnavailable("blocked by test".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push((user_of(query), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_once(&self, _query: &Query) -> Result<Vec<Document>, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fetch_fails.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(self.fetch_result.lock().unwrap().clone())
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: serde_json::Value,
    ) -> Result<(), StoreError> {
        assert_eq!(collection, "notifications");
        assert_eq!(fields, json!({"read": true}));
        self.updates.lock().unwrap().push(id.to_string());
        if self.failing_updates.lock().unwrap().contains(id) {
            return Err(StoreError::Status {
                status: 500,
                body: "write rejected".into(),
            });
        }
        Ok(())
    }
}

fn doc(id: &str, user: &str, minute: u32, read: bool) -> Document {
    Document {
        id: id.to_string(),
        data: json!({
            "userId": user,
            "type": "reply",
            "message": format!("New reply on your question ({})", id),
            "read": read,
            "postId": "post-1",
            "createdAt": format!("2024-09-01T09:{:02}:00Z", minute),
        }),
    }
}

fn setup() -> (Arc<ScriptedStore>, NotificationFeed) {
    let store = Arc::new(ScriptedStore::default());
    let feed = NotificationFeed::new(store.clone(), "notifications");
    (store, feed)
}

async fn wait_until<F>(feed: &NotificationFeed, pred: F) -> FeedSnapshot
where
    F: FnMut(&FeedSnapshot) -> bool,
{
    let mut rx = feed.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("feed did not reach the expected state")
        .expect("feed dropped")
        .clone();
    snapshot
}

fn ids(snapshot: &FeedSnapshot) -> Vec<String> {
    snapshot.notifications.iter().map(|n| n.id.clone()).collect()
}

async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ═══════════════════════════════════════════════════════════════════
//  NotificationFeed
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_loading_until_first_delivery() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;

    let snap = feed.snapshot();
    assert!(snap.loading);
    assert_eq!(snap.status, FeedStatus::Loading);
    assert_eq!(store.listen_calls(), 1);

    store.latest_listener().send(Ok(vec![])).unwrap();
    let snap = wait_until(&feed, |s| !s.loading).await;
    assert_eq!(snap.status, FeedStatus::Live);
}

#[tokio::test]
async fn test_unread_count_tracks_each_snapshot_exactly() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    let tx = store.latest_listener();

    let snapshots = vec![
        vec![doc("n2", "u1", 2, false), doc("n1", "u1", 1, false)],
        vec![doc("n3", "u1", 3, false), doc("n2", "u1", 2, true), doc("n1", "u1", 1, true)],
        // Duplicate delivery must not double count.
        vec![doc("n3", "u1", 3, false), doc("n2", "u1", 2, true), doc("n1", "u1", 1, true)],
        vec![doc("n3", "u1", 3, true)],
        vec![],
    ];

    for docs in snapshots {
        let expected_ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        let expected_unread = docs.iter().filter(|d| d.data["read"] == false).count();
        tx.send(Ok(docs)).unwrap();

        let snap = wait_until(&feed, |s| !s.loading && ids(s) == expected_ids).await;
        assert_eq!(snap.unread_count, expected_unread);
        assert_eq!(feed.current_unread_count(), expected_unread);
    }
}

#[tokio::test]
async fn test_delivery_order_is_kept() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    store
        .latest_listener()
        .send(Ok(vec![doc("n2", "u1", 2, false), doc("n1", "u1", 1, false)]))
        .unwrap();

    let snap = wait_until(&feed, |s| !s.loading).await;
    assert_eq!(ids(&snap), vec!["n2", "n1"]);
    assert_eq!(snap.unread_count, 2);
}

#[tokio::test]
async fn test_late_delivery_from_previous_user_is_discarded() {
    let (store, feed) = setup();
    let _a = feed.subscribe(Some("alice".into())).await;
    let _b = feed.subscribe(Some("bob".into())).await;

    let alice_tx = store.listener(0);
    let bob_tx = store.listener(1);

    // Alice's listener may already be gone; either way nothing may land.
    let _ = alice_tx.send(Ok(vec![doc("a1", "alice", 1, false)]));
    bob_tx.send(Ok(vec![doc("b1", "bob", 1, false)])).unwrap();

    let snap = wait_until(&feed, |s| !s.loading).await;
    assert_eq!(snap.user_id.as_deref(), Some("bob"));
    assert_eq!(ids(&snap), vec!["b1"]);

    let _ = alice_tx.send(Ok(vec![doc("a2", "alice", 2, false)]));
    settle_tasks().await;
    assert_eq!(ids(&feed.snapshot()), vec!["b1"]);
    assert!(alice_tx.is_closed(), "alice's listener must be unregistered");
}

#[tokio::test]
async fn test_push_failure_falls_back_to_single_fetch() {
    let (store, feed) = setup();
    store.live_unavailable.store(true, Ordering::SeqCst);
    store.set_fetch_result(vec![doc("n2", "u1", 2, false), doc("n1", "u1", 1, true)]);

    let handle = feed.subscribe(Some("u1".into())).await;
    assert!(!handle.is_live());
    assert_eq!(store.fetch_calls(), 1);

    let snap = feed.snapshot();
    assert_eq!(ids(&snap), vec!["n2", "n1"]);
    assert_eq!(snap.unread_count, 1);
    assert!(!snap.loading);
    assert_eq!(snap.status, FeedStatus::Degraded);

    // Remote changes are invisible until an explicit refetch.
    store.set_fetch_result(vec![doc("n3", "u1", 3, false)]);
    settle_tasks().await;
    assert_eq!(ids(&feed.snapshot()), vec!["n2", "n1"]);
    assert_eq!(store.fetch_calls(), 1);

    // The pull-fallback handle has nothing to cancel.
    handle.cancel();
    assert_eq!(feed.status(), FeedStatus::Degraded);

    feed.refetch().await;
    assert_eq!(store.fetch_calls(), 2);
    assert_eq!(ids(&feed.snapshot()), vec!["n3"]);
}

#[tokio::test]
async fn test_failed_fallback_fetch_yields_empty_feed() {
    let (store, feed) = setup();
    store.live_unavailable.store(true, Ordering::SeqCst);
    store.fetch_fails.store(true, Ordering::SeqCst);

    feed.subscribe(Some("u1".into())).await;

    let snap = feed.snapshot();
    assert!(snap.notifications.is_empty());
    assert_eq!(snap.unread_count, 0);
    assert!(!snap.loading);
    assert_eq!(snap.status, FeedStatus::Degraded);
}

#[tokio::test]
async fn test_listener_error_degrades_with_one_fetch() {
    let (store, feed) = setup();
    store.set_fetch_result(vec![doc("n1", "u1", 1, false)]);
    let _handle = feed.subscribe(Some("u1".into())).await;

    let tx = store.latest_listener();
    tx.send(Ok(vec![])).unwrap();
    wait_until(&feed, |s| s.status == FeedStatus::Live).await;

    tx.send(Err(StoreError::Listen("connection reset".into()))).unwrap();
    let snap = wait_until(&feed, |s| s.status == FeedStatus::Degraded).await;
    assert_eq!(ids(&snap), vec!["n1"]);
    assert_eq!(store.fetch_calls(), 1);
}

#[tokio::test]
async fn test_listener_closing_before_first_delivery_falls_back() {
    let (store, feed) = setup();
    store.set_fetch_result(vec![doc("n1", "u1", 1, false)]);
    let _handle = feed.subscribe(Some("u1".into())).await;

    // Closing every sender ends the stream without a single delivery.
    store.listeners.lock().unwrap().clear();

    let snap = wait_until(&feed, |s| !s.loading).await;
    assert_eq!(snap.status, FeedStatus::Degraded);
    assert_eq!(ids(&snap), vec!["n1"]);
    assert_eq!(store.fetch_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_refetch_keeps_one_listener() {
    let (store, feed) = setup();
    let _first = feed.subscribe(Some("u1".into())).await;
    let (_a, _b) = tokio::join!(feed.refetch(), feed.refetch());

    assert_eq!(store.listen_calls(), 3);
    settle_tasks().await;
    assert_eq!(store.open_listeners(), 1, "refetch must supersede, not stack");
}

#[tokio::test]
async fn test_silent_listener_does_not_block_settling() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    assert_eq!(store.listen_calls(), 1);

    // Connected, but the listener never delivers.
    let snap = tokio::time::timeout(
        Duration::from_secs(2),
        feed.settled_within(Duration::from_millis(50)),
    )
    .await
    .expect("settled_within must return once its limit passes");

    assert!(snap.loading);
    assert_eq!(snap.status, FeedStatus::Loading);
    assert!(snap.notifications.is_empty());
    assert_eq!(snap.unread_count, 0);
}

#[tokio::test]
async fn test_settled_within_returns_first_delivery() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    store
        .latest_listener()
        .send(Ok(vec![doc("n1", "u1", 1, false)]))
        .unwrap();

    let snap = feed.settled_within(Duration::from_secs(2)).await;
    assert!(!snap.loading);
    assert_eq!(ids(&snap), vec!["n1"]);
    assert_eq!(snap.unread_count, 1);
}

#[tokio::test]
async fn test_cancel_stops_deliveries() {
    let (store, feed) = setup();
    let handle = feed.subscribe(Some("u1".into())).await;
    let tx = store.latest_listener();
    tx.send(Ok(vec![doc("n1", "u1", 1, false)])).unwrap();
    wait_until(&feed, |s| !s.loading).await;

    handle.cancel();
    let _ = tx.send(Ok(vec![doc("n2", "u1", 2, false)]));
    settle_tasks().await;

    assert_eq!(feed.status(), FeedStatus::Idle);
    assert_eq!(ids(&feed.snapshot()), vec!["n1"]);
    assert!(tx.is_closed());
}

#[tokio::test]
async fn test_logout_clears_feed() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    store.latest_listener().send(Ok(vec![doc("n1", "u1", 1, false)])).unwrap();
    wait_until(&feed, |s| !s.loading).await;

    feed.subscribe(None).await;
    let snap = feed.snapshot();
    assert!(snap.notifications.is_empty());
    assert_eq!(snap.unread_count, 0);
    assert_eq!(snap.status, FeedStatus::Idle);
    assert_eq!(store.listen_calls(), 1);
}

// ═══════════════════════════════════════════════════════════════════
//  ReadStateReconciler
// ═══════════════════════════════════════════════════════════════════

fn notification(id: &str, read: bool) -> Notification {
    Notification::from_document(&doc(id, "u1", 1, read), chrono::Utc::now()).unwrap()
}

#[tokio::test]
async fn test_mark_read_on_read_notification_writes_nothing() {
    let (store, feed) = setup();
    let reconciler = ReadStateReconciler::new(feed.clone());

    let outcome = reconciler.mark_read(&notification("n1", true)).await.unwrap();
    assert_eq!(outcome, MarkRead::AlreadyRead);
    assert_eq!(store.update_calls(), 0);
    assert_eq!(store.listen_calls(), 0);
}

#[tokio::test]
async fn test_mark_read_writes_once_then_refetches() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    let reconciler = ReadStateReconciler::new(feed.clone());

    let outcome = reconciler.mark_read(&notification("n1", false)).await.unwrap();
    assert_eq!(outcome, MarkRead::Marked);
    assert_eq!(*store.updates.lock().unwrap(), vec!["n1".to_string()]);
    assert_eq!(store.listen_calls(), 2);
}

#[tokio::test]
async fn test_mark_read_failure_is_reported_without_refetch() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    store
        .latest_listener()
        .send(Ok(vec![doc("n1", "u1", 1, false)]))
        .unwrap();
    wait_until(&feed, |s| !s.loading).await;
    store.fail_update_for("n1");

    let reconciler = ReadStateReconciler::new(feed.clone());
    let err = reconciler.mark_read(&notification("n1", false)).await.unwrap_err();
    assert!(matches!(err, FeedError::UpdateFailed { ref id, .. } if id == "n1"));
    assert!(err.is_retryable());

    assert_eq!(store.listen_calls(), 1);
    assert_eq!(feed.current_unread_count(), 1, "no optimistic local change");
}

#[tokio::test]
async fn test_mark_all_read_with_nothing_unread_is_noop() {
    let (store, feed) = setup();
    let reconciler = ReadStateReconciler::new(feed.clone());

    let report = reconciler
        .mark_all_read(&[notification("n1", true), notification("n2", true)])
        .await;
    assert!(report.is_noop());
    assert_eq!(store.update_calls(), 0);
    assert_eq!(store.listen_calls(), 0);
}

#[tokio::test]
async fn test_mark_all_read_only_touches_unread() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    let reconciler = ReadStateReconciler::new(feed.clone());

    let report = reconciler
        .mark_all_read(&[notification("n1", false), notification("n2", true), notification("n3", false)])
        .await;

    let mut written = store.updates.lock().unwrap().clone();
    written.sort();
    assert_eq!(written, vec!["n1", "n3"]);
    assert!(report.is_complete());
    assert_eq!(report.marked.len(), 2);
    assert_eq!(store.listen_calls(), 2);
}

#[tokio::test]
async fn test_mark_all_read_partial_failure_refetches_once() {
    let (store, feed) = setup();
    let _handle = feed.subscribe(Some("u1".into())).await;
    store.fail_update_for("n2");
    let reconciler = ReadStateReconciler::new(feed.clone());

    let report = reconciler
        .mark_all_read(&[notification("n1", false), notification("n2", false), notification("n3", false)])
        .await;

    assert_eq!(store.update_calls(), 3);
    assert_eq!(report.marked.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, "n2");
    assert_eq!(store.listen_calls(), 2, "exactly one refetch after the batch");
}
