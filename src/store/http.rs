//! HttpStore: client for a hosted document-collection service.
//!
//! Wire mapping:
//!
//! ```text
//! GET   {base}/v1/collections/{collection}/documents?where=userId==u1&orderBy=createdAt&direction=desc&limit=50
//!       → {"documents": [{"id": "...", "data": {...}}, ...]}
//! PATCH {base}/v1/collections/{collection}/documents/{id}     body: partial fields
//! GET   ws(s)://{host}/v1/collections/{collection}/listen?<same params>
//!       → one text frame per change, each a full `{"documents": [...]}` snapshot
//! ```
//!
//! Every request carries `Authorization: Bearer <api key>` when a key is configured.

use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{Document, DocumentStore, Filter, Query, SnapshotStream};
use crate::config::Config;
use crate::errors::StoreError;

#[derive(Debug, Deserialize)]
struct DocumentsEnvelope {
    documents: Vec<Document>,
}

#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent("StudyMate-Inbox/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, StoreError> {
        Self::new(
            &cfg.store_url,
            cfg.api_key.clone(),
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects cannot-be-a-base URLs, so segments are always available.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn documents_url(&self, collection: &str) -> Url {
        self.endpoint(&["v1", "collections", collection, "documents"])
    }

    fn listen_url(&self, query: &Query) -> Result<Url, StoreError> {
        let mut url = self.endpoint(&["v1", "collections", &query.collection, "listen"]);
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            StoreError::SubscriptionUnavailable(format!("cannot derive websocket url from {}", self.base_url))
        })?;
        url.query_pairs_mut().extend_pairs(query_params(query));
        Ok(url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

/// Encode filters, ordering and limit as query parameters.
fn query_params(query: &Query) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    for filter in &query.filters {
        match filter {
            Filter::Eq { field, value } => {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                params.push(("where", format!("{}=={}", field, value)));
            }
        }
    }
    if let Some(order) = &query.order_by {
        params.push(("orderBy", order.field.clone()));
        params.push(("direction", order.direction.as_str().to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

fn decode_frame(bytes: &[u8]) -> Result<Vec<Document>, StoreError> {
    let envelope: DocumentsEnvelope = serde_json::from_slice(bytes)?;
    Ok(envelope.documents)
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn listen(&self, query: &Query) -> Result<SnapshotStream, StoreError> {
        let url = self.listen_url(query)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StoreError::SubscriptionUnavailable(e.to_string()))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| StoreError::SubscriptionUnavailable(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _resp) = tokio_tungstenite::connect_async(request).await.map_err(|e| {
            tracing::debug!(collection = %query.collection, error = %e, "websocket upgrade failed");
            StoreError::SubscriptionUnavailable(e.to_string())
        })?;

        tracing::debug!(collection = %query.collection, "live listener connected");

        let snapshots = ws.filter_map(|msg| {
            let item = match msg {
                Ok(Message::Text(text)) => Some(decode_frame(text.as_bytes())),
                Ok(Message::Binary(bytes)) => Some(decode_frame(&bytes)),
                // Control frames carry no data; Close is followed by end of stream.
                Ok(_) => None,
                Err(e) => Some(Err(StoreError::Listen(e.to_string()))),
            };
            future::ready(item)
        });

        Ok(snapshots.boxed())
    }

    async fn fetch_once(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let req = self
            .client
            .get(self.documents_url(&query.collection))
            .query(&query_params(query));
        let resp = self.authorized(req).send().await?;
        let resp = error_for_status(resp).await?;
        let envelope: DocumentsEnvelope = resp.json().await?;
        Ok(envelope.documents)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut url = self.documents_url(collection);
        if let Ok(mut path) = url.path_segments_mut() {
            path.push(id);
        }

        let req = self.client.patch(url).json(&fields);
        let resp = self.authorized(req).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        error_for_status(resp).await?;
        Ok(())
    }
}
