use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::storage::{Article, Category};
use crate::util::{validate_base_url, UrlValidationError, MAX_SEARCH_QUERY_LENGTH};

pub const DEFAULT_BASE_URL: &str = "https://newsapi.org/v2";

const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024; // 5MB

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The API answered with `status: "error"`
    #[error("News API error ({code}): {message}")]
    Api { code: String, message: String },
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("No news API key configured (set NEWS_API_KEY or news_api_key)")]
    MissingApiKey,
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
    #[error("Invalid base URL: {0}")]
    BaseUrl(UrlValidationError),
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl FetchError {
    /// Returns true if this error is transient and the request should be retried.
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::HttpStatus(status) => *status == 429 || *status >= 500,
            FetchError::Api { .. }
            | FetchError::ResponseTooLarge(_)
            | FetchError::MissingApiKey
            | FetchError::InsecureBaseUrl
            | FetchError::BaseUrl(_)
            | FetchError::Parse(_) => false,
        }
    }
}

impl From<UrlValidationError> for FetchError {
    fn from(err: UrlValidationError) -> Self {
        match err {
            UrlValidationError::Insecure => FetchError::InsecureBaseUrl,
            other => FetchError::BaseUrl(other),
        }
    }
}

/// Source of raw article batches.
#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch_headlines(&self, category: Category) -> Result<Vec<Article>, FetchError>;
    async fn search(&self, query: &str) -> Result<Vec<Article>, FetchError>;
}

/// Connection settings for [`NewsApiClient`].
#[derive(Debug)]
pub struct NewsApiConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub country: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry
    pub retry_backoff: Duration,
}

impl Default for NewsApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            country: "us".to_string(),
            page_size: 20,
            request_timeout: Duration::from_secs(10),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// HTTP client for the NewsAPI `top-headlines` and `everything` endpoints.
#[derive(Debug)]
pub struct NewsApiClient {
    client: reqwest::Client,
    base: String,
    config: NewsApiConfig,
}

impl NewsApiClient {
    /// # Errors
    ///
    /// Rejects a base URL that is not https (loopback http is allowed).
    pub fn new(config: NewsApiConfig) -> Result<Self, FetchError> {
        validate_base_url(&config.base_url)?;
        if config.base_url.starts_with("http://") {
            tracing::warn!(base_url = %config.base_url, "Using non-HTTPS news API base URL (localhost only)");
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("newsdesk/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base: config.base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn endpoint(&self, name: &str) -> Result<Url, FetchError> {
        Url::parse(&format!("{}/{}", self.base, name))
            .map_err(|e| FetchError::BaseUrl(UrlValidationError::InvalidUrl(e)))
    }

    fn api_key(&self) -> Result<&SecretString, FetchError> {
        self.config.api_key.as_ref().ok_or(FetchError::MissingApiKey)
    }

    /// Send with retry on transient failures.
    /// Backoff doubles from `retry_backoff` for at most `max_retries` retries.
    async fn get_with_retry(&self, url: &Url) -> Result<Vec<ApiArticle>, FetchError> {
        let key = self.api_key()?;
        let mut retry_count = 0;

        loop {
            let attempt = tokio::time::timeout(self.config.request_timeout, self.get_once(url, key))
                .await
                .unwrap_or(Err(FetchError::Timeout));

            match attempt {
                Ok(articles) => return Ok(articles),
                Err(e) if e.is_retryable() && retry_count < self.config.max_retries => {
                    let delay = self.config.retry_backoff * (1u32 << retry_count.min(16));
                    tracing::debug!(
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying news API request after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &Url, key: &SecretString) -> Result<Vec<ApiArticle>, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header("X-Api-Key", key.expose_secret())
            .send()
            .await?;

        let status = response.status();
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;

        if !status.is_success() {
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }
            // NewsAPI reports auth and parameter problems as 4xx with an error body
            return Err(match serde_json::from_slice::<ApiResponse>(&body) {
                Ok(parsed) if parsed.is_error() => parsed.into_error(),
                _ => FetchError::HttpStatus(status.as_u16()),
            });
        }

        let parsed: ApiResponse = serde_json::from_slice(&body)?;
        if parsed.is_error() {
            return Err(parsed.into_error());
        }
        Ok(parsed.articles)
    }
}

#[async_trait]
impl NewsSource for NewsApiClient {
    async fn fetch_headlines(&self, category: Category) -> Result<Vec<Article>, FetchError> {
        let mut url = self.endpoint("top-headlines")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("country", &self.config.country);
            if let Some(value) = category.api_value() {
                query.append_pair("category", value);
            }
            query.append_pair("pageSize", &self.config.page_size.to_string());
        }

        let raw = self.get_with_retry(&url).await?;
        let total = raw.len();
        let articles: Vec<Article> = raw
            .into_iter()
            .filter_map(|a| a.into_article(category.api_value()))
            .collect();

        tracing::info!(
            category = %category,
            received = total,
            kept = articles.len(),
            "Fetched headlines"
        );
        Ok(articles)
    }

    async fn search(&self, query: &str) -> Result<Vec<Article>, FetchError> {
        let query: String = query.trim().chars().take(MAX_SEARCH_QUERY_LENGTH).collect();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut url = self.endpoint("everything")?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("language", "en")
            .append_pair("pageSize", &self.config.page_size.to_string())
            .append_pair("sortBy", "relevancy");

        let raw = self.get_with_retry(&url).await?;
        let articles: Vec<Article> = raw
            .into_iter()
            .filter_map(|a| a.into_article(None))
            .collect();

        tracing::info!(results = articles.len(), "Search completed");
        Ok(articles)
    }
}

/// Read a response body, failing once it exceeds `limit` bytes.
async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

// ============================================================================
// Wire Format
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<ApiArticle>,
}

impl ApiResponse {
    fn is_error(&self) -> bool {
        self.status == "error"
    }

    fn into_error(self) -> FetchError {
        FetchError::Api {
            code: self.code.unwrap_or_else(|| "unknown".to_string()),
            message: self.message.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiArticle {
    #[serde(default)]
    source: Option<ApiSource>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    url_to_image: Option<String>,
    published_at: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSource {
    name: Option<String>,
}

impl ApiArticle {
    /// Convert to an [`Article`], dropping entries without a URL or title.
    ///
    /// Headline batches are labelled with the requested category; for the
    /// unfiltered "all" request and for search results the source name stands in.
    fn into_article(self, category: Option<&str>) -> Option<Article> {
        let url = non_blank(self.url)?;
        let title = non_blank(self.title)?;
        let source_name = self.source.and_then(|s| non_blank(s.name));

        let label = match category {
            Some(c) => Some(c.to_string()),
            None => source_name.clone(),
        };

        Some(Article {
            id: url,
            title,
            description: non_blank(self.description),
            content: non_blank(self.content),
            author: non_blank(self.author),
            published_at: self.published_at.as_deref().and_then(parse_timestamp),
            image_url: non_blank(self.url_to_image),
            source_name,
            category: label,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| tracing::trace!(value = %raw, error = %e, "Ignoring unparseable publishedAt"))
        .ok()
}
