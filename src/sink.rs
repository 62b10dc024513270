//! Document sink
//!
//! Metrics and enriched CloudTrail events are shipped as JSON documents to
//! a sink. Indexing is fire-and-forget: a sink failure is logged, never
//! raised, so observability problems cannot stall governance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

/// Destination for metrics and event documents.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Store `document` under `index`/`id`. Never fails; problems are
    /// logged by the implementation.
    async fn index(&self, index: &str, id: &str, document: &Value);
}

/// Elasticsearch-backed sink: one HTTP PUT per document.
pub struct EsSink {
    endpoint: String,
    client: reqwest::Client,
}

impl EsSink {
    /// `endpoint` is the cluster base URL, e.g. `http://es.internal:9200`.
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Sink for EsSink {
    async fn index(&self, index: &str, id: &str, document: &Value) {
        let url = format!("{}/{}/_doc/{}", self.endpoint, index, id);
        match self.client.put(&url).json(document).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(index = %index, id = %id, "Indexed document");
            }
            Ok(response) => {
                warn!(index = %index, id = %id, status = %response.status(), "Sink rejected document");
            }
            Err(e) => {
                warn!(index = %index, id = %id, error = %e, "Cannot reach sink");
            }
        }
    }
}

/// Sink used when no endpoint is configured; drops everything.
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn index(&self, _index: &str, _id: &str, _document: &Value) {}
}

/// Daily event index name, `<prefix>YYYY.MM.DD`.
pub fn event_index(prefix: &str, when: DateTime<Utc>) -> String {
    format!("{}{}", prefix, when.format("%Y.%m.%d"))
}
