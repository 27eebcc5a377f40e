use thiserror::Error;

/// Failures reported by a [`DocumentStore`](crate::store::DocumentStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot deliver live updates in this environment.
    #[error("live updates unavailable: {0}")]
    SubscriptionUnavailable(String),

    /// A live listener that was established later failed.
    #[error("listener failed: {0}")]
    Listen(String),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid store url: {0}")]
    Url(#[from] url::ParseError),
}

/// Errors crossing the feed / reconciler boundary.
///
/// Only `UpdateFailed` is ever returned to callers; the other two variants
/// are recovered inside [`NotificationFeed`](crate::feed::NotificationFeed)
/// and exist so recovery paths log a typed error.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("realtime notifications not available: {0}")]
    SubscriptionUnavailable(#[source] StoreError),

    #[error("failed to fetch notifications: {0}")]
    FetchFailed(#[source] StoreError),

    #[error("failed to mark notification {id} as read: {source}")]
    UpdateFailed {
        id: String,
        #[source]
        source: StoreError,
    },
}

impl FeedError {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::UpdateFailed { source, .. } => !matches!(source, StoreError::NotFound { .. }),
            FeedError::SubscriptionUnavailable(_) | FeedError::FetchFailed(_) => true,
        }
    }
}
