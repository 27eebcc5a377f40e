//! Remote document-collection capability consumed by the inbox.
//!
//! The feed never talks to a backend SDK directly; it goes through
//! [`DocumentStore`]. Implementations:
//!   - [`memory::MemoryStore`]: in-process collections with live listeners.
//!   - [`http::HttpStore`]: REST for reads/writes, WebSocket for live snapshots.

pub mod http;
pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// One record of a collection: store-assigned id plus its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: serde_json::Value,
}

/// Full result set of a listened query, re-delivered on every change.
pub type SnapshotStream = BoxStream<'static, Result<Vec<Document>, StoreError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: serde_json::Value },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, data: &serde_json::Value) -> bool {
        match self {
            Filter::Eq { field, value } => data.get(field) == Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A filtered, ordered view over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Evaluate this query over an in-memory set of documents.
    /// Ties on the order field fall back to document id.
    pub fn apply<'a, I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut out: Vec<Document> = docs
            .into_iter()
            .filter(|doc| self.filters.iter().all(|f| f.matches(&doc.data)))
            .cloned()
            .collect();

        if let Some(order) = &self.order_by {
            out.sort_by(|a, b| {
                let ord = compare_values(a.data.get(&order.field), b.data.get(&order.field));
                let ord = match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                ord.then_with(|| a.id.cmp(&b.id))
            });
        }

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Ordering for field values: timestamps chronologically, numbers numerically,
/// everything else by its string form. Missing values sort first.
fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            // Timestamps rank before other strings so mixed columns stay totally ordered.
            match (
                chrono::DateTime::parse_from_rfc3339(x),
                chrono::DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => x.cmp(y),
            }
        }
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Abstraction over the remote document store backing the inbox.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Register a push listener for `query`.
    ///
    /// Fails with [`StoreError::SubscriptionUnavailable`] when live updates
    /// cannot be delivered in this environment. Dropping the stream
    /// unregisters the listener.
    async fn listen(&self, query: &Query) -> Result<SnapshotStream, StoreError>;

    /// One-shot pull of the current result set.
    async fn fetch_once(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Merge `fields` into an existing document.
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: serde_json::Value,
    ) -> Result<(), StoreError>;
}
