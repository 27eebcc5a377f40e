//! In-process document store with live listeners.
//!
//! Mirrors the behavior of the hosted store closely enough to run the feed
//! locally: every write to a collection re-evaluates each listener's query
//! and pushes the full result set. Live delivery can be switched off to
//! emulate environments where the realtime channel is blocked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{future, stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{Document, DocumentStore, Query, SnapshotStream};
use crate::errors::StoreError;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    /// collection name → documents
    collections: DashMap<String, Vec<Document>>,
    /// Names of collections that changed.
    changes: broadcast::Sender<String>,
    live: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                collections: DashMap::new(),
                changes,
                live: AtomicBool::new(true),
            }),
        }
    }

    /// A store whose `listen` always fails, so callers fall back to pulling.
    pub fn without_live_updates() -> Self {
        let store = Self::new();
        store.set_live_updates(false);
        store
    }

    pub fn set_live_updates(&self, enabled: bool) {
        self.inner.live.store(enabled, Ordering::SeqCst);
    }

    /// Add a document with a generated id. Returns the id.
    pub fn insert(&self, collection: &str, data: serde_json::Value) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.insert_with_id(collection, &id, data);
        id
    }

    /// Add or replace a document under a caller-chosen id.
    pub fn insert_with_id(&self, collection: &str, id: &str, data: serde_json::Value) {
        {
            let mut docs = self.inner.collections.entry(collection.to_string()).or_default();
            docs.retain(|d| d.id != id);
            docs.push(Document {
                id: id.to_string(),
                data,
            });
        }
        self.notify(collection);
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.inner
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id).cloned())
    }

    /// Number of registered live listeners across all collections.
    pub fn listener_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    fn snapshot(&self, query: &Query) -> Vec<Document> {
        match self.inner.collections.get(&query.collection) {
            Some(docs) => query.apply(docs.iter()),
            None => Vec::new(),
        }
    }

    fn notify(&self, collection: &str) {
        // No receivers is fine: nobody is listening.
        let _ = self.inner.changes.send(collection.to_string());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn listen(&self, query: &Query) -> Result<SnapshotStream, StoreError> {
        if !self.inner.live.load(Ordering::SeqCst) {
            return Err(StoreError::SubscriptionUnavailable(
                "live updates disabled for this store".to_string(),
            ));
        }

        // Subscribe before taking the first snapshot so no write falls between.
        let changes = BroadcastStream::new(self.inner.changes.subscribe());
        let initial = self.snapshot(query);

        let store = self.clone();
        let query = query.clone();
        let updates = changes.filter_map(move |msg| {
            let snapshot = match msg {
                Ok(collection) if collection == query.collection => Some(Ok(store.snapshot(&query))),
                Ok(_) => None,
                // Missed some change notices; a fresh full snapshot covers them.
                Err(_) => Some(Ok(store.snapshot(&query))),
            };
            future::ready(snapshot)
        });

        Ok(stream::once(future::ready(Ok(initial))).chain(updates).boxed())
    }

    async fn fetch_once(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        Ok(self.snapshot(query))
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: serde_json::Value,
    ) -> Result<(), StoreError> {
        {
            let mut docs = self.inner.collections.get_mut(collection).ok_or_else(|| {
                StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                }
            })?;
            let doc = docs.iter_mut().find(|d| d.id == id).ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

            match fields {
                serde_json::Value::Object(patch) if doc.data.is_object() => {
                    if let Some(existing) = doc.data.as_object_mut() {
                        existing.extend(patch);
                    }
                }
                other => doc.data = other,
            }
        }
        self.notify(collection);
        Ok(())
    }
}
