//! The bulk indexer.
//!
//! The engine talks to Elasticsearch/OpenSearch through the [`BulkIndexer`]
//! trait: upserts and deletes travel as [`DocAction`]s, acknowledgement is
//! per item, and failures classify into retryable (429/503, network) and
//! fatal (any other 4xx). The HTTP implementation chunks actions by count
//! and by body size and submits chunks through a bounded pool of concurrent
//! requests.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::query::{doc_id, DocumentKey};
use crate::settings::Settings;

/// One action against the index.
#[derive(Debug, Clone, PartialEq)]
pub enum DocAction {
    /// Upsert a document by id.
    Index { id: String, source: Value },
    /// Delete a document by id.
    Delete { id: String },
}

impl DocAction {
    pub fn id(&self) -> &str {
        match self {
            DocAction::Index { id, .. } => id,
            DocAction::Delete { id } => id,
        }
    }

    pub fn upsert(key: &DocumentKey, source: Value) -> Self {
        DocAction::Index {
            id: doc_id(key),
            source,
        }
    }

    pub fn delete(key: &DocumentKey) -> Self {
        DocAction::Delete { id: doc_id(key) }
    }
}

#[async_trait]
pub trait BulkIndexer: Send + Sync {
    /// Apply the actions; returns the number acknowledged. The whole call
    /// fails with the worst per-item classification.
    async fn bulk(&self, index: &str, actions: Vec<DocAction>) -> Result<usize, SyncError>;

    /// Delete every document in the index. Used for TRUNCATE on the pivot.
    async fn delete_by_query_all(&self, index: &str) -> Result<(), SyncError>;
}

/// HTTP `_bulk` client.
pub struct HttpIndexer {
    http: reqwest::Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    chunk_size: usize,
    max_chunk_bytes: usize,
    thread_count: usize,
    max_retries: usize,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
}

impl HttpIndexer {
    pub fn new(settings: &Settings) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(settings.elasticsearch_timeout)
            .build()
            .map_err(|e| SyncError::IndexerRetryable(e.to_string()))?;
        Ok(HttpIndexer {
            http,
            base_url: settings.elasticsearch_url.trim_end_matches('/').to_string(),
            user: settings.elasticsearch_user.clone(),
            password: settings.elasticsearch_password.clone(),
            chunk_size: settings.elasticsearch_chunk_size,
            max_chunk_bytes: settings.elasticsearch_max_chunk_bytes,
            thread_count: settings.elasticsearch_thread_count.max(1),
            max_retries: settings.elasticsearch_max_retries,
            initial_backoff: settings.elasticsearch_initial_backoff,
            max_backoff: settings.elasticsearch_max_backoff,
        })
    }

    /// Render actions into ndjson bodies, splitting on the document-count
    /// and body-size limits.
    fn chunk_bodies(&self, index: &str, actions: &[DocAction]) -> Result<Vec<String>, SyncError> {
        let mut bodies = Vec::new();
        let mut body = String::new();
        let mut docs = 0usize;

        for action in actions {
            let rendered = match action {
                DocAction::Index { id, source } => format!(
                    "{}\n{}\n",
                    json!({"index": {"_index": index, "_id": id}}),
                    serde_json::to_string(source)?
                ),
                DocAction::Delete { id } => {
                    format!("{}\n", json!({"delete": {"_index": index, "_id": id}}))
                }
            };
            if docs >= self.chunk_size
                || (!body.is_empty() && body.len() + rendered.len() > self.max_chunk_bytes)
            {
                bodies.push(std::mem::take(&mut body));
                docs = 0;
            }
            body.push_str(&rendered);
            docs += 1;
        }
        if !body.is_empty() {
            bodies.push(body);
        }
        Ok(bodies)
    }

    async fn submit(&self, body: String) -> Result<usize, SyncError> {
        let mut request = self
            .http
            .post(format!("{}/_bulk", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::IndexerRetryable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), "bulk request"));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| SyncError::IndexerRetryable(e.to_string()))?;

        let mut acked = 0usize;
        let mut worst: Option<SyncError> = None;
        if let Some(items) = parsed.get("items").and_then(Value::as_array) {
            for item in items {
                let result = item
                    .as_object()
                    .and_then(|object| object.values().next())
                    .cloned()
                    .unwrap_or(Value::Null);
                let status = result.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
                if status < 300 {
                    acked += 1;
                    continue;
                }
                let reason = result
                    .get("error")
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("status {status}"));
                let error = classify_status(status, &reason);
                worst = Some(match (worst.take(), error) {
                    (Some(SyncError::IndexerFatal(msg)), _) => SyncError::IndexerFatal(msg),
                    (_, error) => error,
                });
            }
        }

        match worst {
            Some(error) => Err(error),
            None => Ok(acked),
        }
    }

    /// Submit one chunk, retrying retryable failures up to the configured
    /// retry limit with exponential backoff.
    async fn submit_with_retry(&self, body: String) -> Result<usize, SyncError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0usize;
        loop {
            match self.submit(body.clone()).await {
                Ok(acked) => return Ok(acked),
                Err(e) if matches!(e, SyncError::IndexerRetryable(_)) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!("bulk chunk failed (attempt {attempt}): {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl BulkIndexer for HttpIndexer {
    async fn bulk(&self, index: &str, actions: Vec<DocAction>) -> Result<usize, SyncError> {
        if actions.is_empty() {
            return Ok(0);
        }
        let bodies = self.chunk_bodies(index, &actions)?;
        debug!(
            "submitting {} actions to {index} in {} chunks",
            actions.len(),
            bodies.len()
        );

        let results: Vec<Result<usize, SyncError>> = stream::iter(bodies)
            .map(|body| self.submit_with_retry(body))
            .buffer_unordered(self.thread_count)
            .collect()
            .await;

        let mut acked = 0usize;
        let mut worst: Option<SyncError> = None;
        for result in results {
            match result {
                Ok(count) => acked += count,
                Err(error) => {
                    worst = Some(match (worst.take(), error) {
                        (Some(SyncError::IndexerFatal(msg)), _) => SyncError::IndexerFatal(msg),
                        (_, error) => error,
                    });
                }
            }
        }
        match worst {
            Some(error) => Err(error),
            None => Ok(acked),
        }
    }

    async fn delete_by_query_all(&self, index: &str) -> Result<(), SyncError> {
        let mut request = self
            .http
            .post(format!("{}/{index}/_delete_by_query", self.base_url))
            .json(&json!({"query": {"match_all": {}}}));
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::IndexerRetryable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), "delete_by_query"));
        }
        Ok(())
    }
}

/// 429/503 and 5xx are retryable; any other 4xx is fatal.
fn classify_status(status: u16, context: &str) -> SyncError {
    if status == 429 || status >= 500 {
        SyncError::IndexerRetryable(format!("{context}: status {status}"))
    } else {
        SyncError::IndexerFatal(format!("{context}: status {status}"))
    }
}
