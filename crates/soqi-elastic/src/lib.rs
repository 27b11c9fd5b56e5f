//! Elasticsearch destination client: watermark reads and bulk upserts.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use soqi_core::QuestionDocument;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "soqi-elastic";

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("decoding response body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document is missing id field `{field}`")]
    MissingIdField { field: String },
    #[error("bulk indexing reported {failed} failed item(s): {summary}")]
    BulkFailures { failed: usize, summary: String },
}

#[derive(Debug)]
pub struct ElasticClient {
    client: reqwest::Client,
    config: ElasticConfig,
}

impl ElasticClient {
    pub fn new(config: ElasticConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    /// Max value of `field` across `index`, or `None` when the index is
    /// empty or does not exist yet. Any other failure is fatal: syncing
    /// without a true watermark would re-ingest the full history.
    pub async fn latest_timestamp(
        &self,
        index: &str,
        field: &str,
    ) -> Result<Option<DateTime<Utc>>, IndexError> {
        let url = format!("{}/{}/_search", self.config.base_url, index);
        let body = max_aggregation_body(field);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| IndexError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(index, "index does not exist, no watermark");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(IndexError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|source| IndexError::Decode {
                url: url.clone(),
                source,
            })?;
        Ok(parse_latest_timestamp(&text)?)
    }

    /// Upsert every document in one `_bulk` request, keyed by `id_field`.
    /// Re-submitting an id overwrites the stored document rather than
    /// duplicating it. Returns the number of documents submitted.
    pub async fn bulk_upsert(
        &self,
        index: &str,
        id_field: &str,
        docs: &[QuestionDocument],
    ) -> Result<usize, IndexError> {
        if docs.is_empty() {
            debug!(index, "no documents to index");
            return Ok(0);
        }

        let url = format!("{}/_bulk", self.config.base_url);
        let body = build_bulk_body(index, id_field, docs)?;

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|source| IndexError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|source| IndexError::Decode {
                url: url.clone(),
                source,
            })?;
        check_bulk_response(&text)?;

        info!(index, count = docs.len(), "bulk upsert complete");
        Ok(docs.len())
    }
}

/// Aggregation-only search body asking for the max of one numeric field.
pub fn max_aggregation_body(field: &str) -> JsonValue {
    json!({
        "size": 0,
        "aggs": {
            "latest": {
                "max": { "field": field }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct SearchAggResponse {
    aggregations: Aggregations,
}

#[derive(Debug, Deserialize)]
struct Aggregations {
    latest: MaxAggregation,
}

#[derive(Debug, Deserialize)]
struct MaxAggregation {
    value: Option<f64>,
}

/// Parse the max-aggregation response. The value is `null` when the index
/// holds no documents.
pub fn parse_latest_timestamp(text: &str) -> Result<Option<DateTime<Utc>>, serde_json::Error> {
    let parsed: SearchAggResponse = serde_json::from_str(text)?;
    Ok(parsed
        .aggregations
        .latest
        .value
        .and_then(|epoch| DateTime::from_timestamp(epoch as i64, 0)))
}

/// NDJSON `_bulk` body: per document an `index` action line keyed by the
/// stringified id, followed by the document source.
pub fn build_bulk_body(
    index: &str,
    id_field: &str,
    docs: &[QuestionDocument],
) -> Result<String, IndexError> {
    let mut body = String::new();
    for doc in docs {
        let source = serde_json::to_value(doc)?;
        let id = document_id(&source, id_field)?;
        let action = json!({"index": {"_index": index, "_id": id}});
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&source.to_string());
        body.push('\n');
    }
    Ok(body)
}

fn document_id(source: &JsonValue, id_field: &str) -> Result<String, IndexError> {
    let id = source
        .get(id_field)
        .ok_or_else(|| IndexError::MissingIdField {
            field: id_field.to_string(),
        })?;
    Ok(match id {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<JsonValue>,
}

/// A partial bulk failure is not distinguished from a total one: any item
/// failure fails the run, which is then safely re-runnable from the same
/// watermark because upserts are idempotent.
pub fn check_bulk_response(text: &str) -> Result<(), IndexError> {
    let parsed: BulkResponse = serde_json::from_str(text)?;
    if !parsed.errors {
        return Ok(());
    }

    let failures: Vec<String> = parsed
        .items
        .iter()
        .filter_map(|item| item.get("index"))
        .filter(|op| op.get("error").is_some())
        .map(|op| {
            let id = op.get("_id").and_then(|v| v.as_str()).unwrap_or("?");
            let reason = op
                .pointer("/error/reason")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            format!("{id}: {reason}")
        })
        .collect();

    if failures.is_empty() {
        return Err(IndexError::BulkFailures {
            failed: 1,
            summary: "bulk response flagged errors without item details".to_string(),
        });
    }
    let failed = failures.len();
    let summary = failures.into_iter().take(3).collect::<Vec<_>>().join("; ");
    Err(IndexError::BulkFailures { failed, summary })
}
