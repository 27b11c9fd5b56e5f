//! Incremental sync pipeline: watermark read, bounded fetch, normalize,
//! bulk upsert.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use soqi_core::{normalize_batch, FieldPolicy, QuestionDocument, RawQuestion};
use soqi_elastic::{ElasticClient, ElasticConfig};
use soqi_stackexchange::{SortOrder, StackExchangeClient, StackExchangeConfig};
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "soqi-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub elastic_url: String,
    pub index_name: String,
    pub id_field: String,
    pub timestamp_field: String,
    pub tags: Vec<String>,
    pub site: String,
    pub api_base: String,
    pub max_pages: u32,
    pub page_size: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub excluded_fields: Vec<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            elastic_url: std::env::var("SOQI_ELASTIC_URL")
                .unwrap_or_else(|_| "http://localhost:9200".to_string()),
            index_name: std::env::var("SOQI_INDEX")
                .unwrap_or_else(|_| "stackoverflow-question-items".to_string()),
            id_field: std::env::var("SOQI_ID_FIELD")
                .unwrap_or_else(|_| "question_id".to_string()),
            timestamp_field: std::env::var("SOQI_TIMESTAMP_FIELD")
                .unwrap_or_else(|_| "creation_timestamp".to_string()),
            tags: std::env::var("SOQI_TAGS")
                .map(|raw| split_list(&raw))
                .unwrap_or_else(|_| vec!["pandas".to_string()]),
            site: std::env::var("SOQI_SITE").unwrap_or_else(|_| "stackoverflow".to_string()),
            api_base: std::env::var("SOQI_API_BASE")
                .unwrap_or_else(|_| soqi_stackexchange::DEFAULT_API_BASE.to_string()),
            max_pages: std::env::var("SOQI_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            page_size: std::env::var("SOQI_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            http_timeout_secs: std::env::var("SOQI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("SOQI_USER_AGENT")
                .unwrap_or_else(|_| "soqi-bot/0.1".to_string()),
            excluded_fields: std::env::var("SOQI_EXCLUDED_FIELDS")
                .map(|raw| split_list(&raw))
                .unwrap_or_else(|_| vec!["owner".to_string()]),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Source-side seam: anything that can produce raw questions newer than
/// an optional watermark.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    async fn fetch_since(
        &self,
        tags: &[String],
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawQuestion>>;
}

/// Destination-side seam: watermark reads and idempotent bulk upserts.
#[async_trait]
pub trait QuestionIndex: Send + Sync {
    async fn latest_timestamp(&self, index: &str, field: &str) -> Result<Option<DateTime<Utc>>>;

    async fn bulk_upsert(
        &self,
        index: &str,
        id_field: &str,
        docs: &[QuestionDocument],
    ) -> Result<usize>;
}

#[async_trait]
impl QuestionSource for StackExchangeClient {
    async fn fetch_since(
        &self,
        tags: &[String],
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawQuestion>> {
        self.fetch_questions("creation", SortOrder::Ascending, tags, watermark)
            .await
            .context("fetching questions from the source API")
    }
}

#[async_trait]
impl QuestionIndex for ElasticClient {
    async fn latest_timestamp(&self, index: &str, field: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(ElasticClient::latest_timestamp(self, index, field).await?)
    }

    async fn bulk_upsert(
        &self,
        index: &str,
        id_field: &str,
        docs: &[QuestionDocument],
    ) -> Result<usize> {
        Ok(ElasticClient::bulk_upsert(self, index, id_field, docs).await?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub indexed: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn QuestionSource>,
    index: Box<dyn QuestionIndex>,
    policy: FieldPolicy,
}

impl SyncPipeline {
    /// Build the pipeline with real clients. Clients are constructed once
    /// per run and passed in, never re-created mid-run.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let source = StackExchangeClient::new(StackExchangeConfig {
            api_base: config.api_base.clone(),
            site: config.site.clone(),
            page_size: config.page_size,
            max_pages: config.max_pages,
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let index = ElasticClient::new(ElasticConfig {
            base_url: config.elastic_url.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
        })?;
        Ok(Self::with_collaborators(
            config,
            Box::new(source),
            Box::new(index),
        ))
    }

    /// Substitutable-collaborator constructor; tests pass fakes here.
    pub fn with_collaborators(
        config: SyncConfig,
        source: Box<dyn QuestionSource>,
        index: Box<dyn QuestionIndex>,
    ) -> Self {
        let policy = FieldPolicy::new(config.excluded_fields.clone());
        Self {
            config,
            source,
            index,
            policy,
        }
    }

    /// One full sync: watermark, fetch, normalize, upsert. The watermark is
    /// read once up front, so a failed run that already wrote some records
    /// can be retried in full without double-counting.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let watermark = self
            .index
            .latest_timestamp(&self.config.index_name, &self.config.timestamp_field)
            .await
            .context("reading the watermark from the destination index")?;
        match watermark {
            Some(ts) => info!(%run_id, watermark = %ts, "starting incremental sync"),
            None => info!(%run_id, "destination is empty, starting full sync"),
        }

        let raw = self
            .source
            .fetch_since(&self.config.tags, watermark)
            .await
            .context("fetching new questions")?;
        let fetched = raw.len();

        let docs =
            normalize_batch(raw, &self.policy).context("normalizing fetched questions")?;

        let indexed = self
            .index
            .bulk_upsert(&self.config.index_name, &self.config.id_field, &docs)
            .await
            .context("bulk upserting normalized questions")?;

        let finished_at = Utc::now();
        info!(%run_id, fetched, indexed, "sync run finished");

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            watermark,
            fetched,
            indexed,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config)?;
    pipeline.run_once().await
}
