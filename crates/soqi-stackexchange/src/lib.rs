//! StackExchange API client: paginated question fetches for SOQI.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use soqi_core::RawQuestion;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "soqi-stackexchange";

pub const DEFAULT_API_BASE: &str = "https://api.stackexchange.com/2.3";

#[derive(Debug, Clone)]
pub struct StackExchangeConfig {
    pub api_base: String,
    pub site: String,
    pub page_size: u32,
    /// Hard cap on pages followed per fetch, bounding worst-case latency
    /// and memory for a full-history sync.
    pub max_pages: u32,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for StackExchangeConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            site: "stackoverflow".to_string(),
            page_size: 100,
            max_pages: 300,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_param(self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// One page of the upstream `/questions` response envelope. Quota fields
/// are ignored; throttling is the source's concern, not ours.
#[derive(Debug, Deserialize)]
pub struct QuestionsPage {
    pub items: Vec<RawQuestion>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("at least one tag is required")]
    EmptyTags,
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding questions page from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug)]
pub struct StackExchangeClient {
    client: reqwest::Client,
    config: StackExchangeConfig,
}

impl StackExchangeClient {
    pub fn new(config: StackExchangeConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    /// Fetch every question carrying all of `tags`, following `has_more`
    /// pagination until the source is exhausted or the page cap is hit.
    /// The lower bound is exclusive; see [`exclusive_fromdate`].
    pub async fn fetch_questions(
        &self,
        sort: &str,
        order: SortOrder,
        tags: &[String],
        from: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawQuestion>, SourceError> {
        if tags.is_empty() {
            return Err(SourceError::EmptyTags);
        }

        let url = format!("{}/questions", self.config.api_base);
        let tagged = join_tags(tags);
        let fromdate = from.map(exclusive_fromdate);

        let mut questions = Vec::new();
        for page in 1..=self.config.max_pages {
            let mut request = self
                .client
                .get(&url)
                .query(&[
                    ("site", self.config.site.as_str()),
                    ("sort", sort),
                    ("order", order.as_param()),
                    ("tagged", tagged.as_str()),
                ])
                .query(&[("page", page), ("pagesize", self.config.page_size)]);
            if let Some(fromdate) = fromdate {
                request = request.query(&[("fromdate", fromdate)]);
            }

            let response = request.send().await.map_err(|source| SourceError::Request {
                url: url.clone(),
                source,
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::HttpStatus {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                });
            }

            let page_body: QuestionsPage =
                response.json().await.map_err(|source| SourceError::Decode {
                    url: url.clone(),
                    source,
                })?;

            debug!(
                page,
                items = page_body.items.len(),
                has_more = page_body.has_more,
                "fetched questions page"
            );
            questions.extend(page_body.items);
            if !page_body.has_more {
                break;
            }
        }

        Ok(questions)
    }
}

/// Upstream AND semantics: multiple tags are joined with `;`.
pub fn join_tags(tags: &[String]) -> String {
    tags.join(";")
}

/// `fromdate` is inclusive upstream; shifting the watermark by one second
/// makes the bound exclusive, so the boundary record already present in
/// the destination is never re-fetched.
pub fn exclusive_fromdate(from: DateTime<Utc>) -> i64 {
    from.timestamp() + 1
}
