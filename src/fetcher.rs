//! Page and stylesheet fetching
//!
//! The processor only depends on the [`PageFetcher`] trait; [`HttpFetcher`]
//! is the reqwest-backed implementation used in production. TLS verification
//! is configurable and off by default: the pages being optimized were already
//! trusted by whoever enqueued them.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::FetchConfig;

/// Errors that can occur during fetching
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Content too large: {0} bytes")]
    ContentTooLarge(usize),
    #[error("Failed to parse URL: {0}")]
    InvalidUrl(String),
}

/// A successfully fetched body
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// The fetched URL (may differ from request due to redirects)
    pub final_url: Url,
    /// HTTP status code
    pub status_code: u16,
    /// Content type, if the server sent one
    pub content_type: Option<String>,
    /// Response body
    pub body: String,
}

impl FetchedBody {
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

/// Retrieves page HTML and stylesheet text
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &Url) -> Result<FetchedBody, FetchError>;
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
    max_content_size: usize,
}

impl HttpFetcher {
    /// Create a new fetcher from configuration
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(&config.user_agent)
            .danger_accept_invalid_certs(!config.verify_tls)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            max_content_size: config.max_content_size,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &Url) -> Result<FetchedBody, FetchError> {
        let response = self.client.get(url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let final_url = Url::parse(response.url().as_str())
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(len) = response.content_length() {
            if len as usize > self.max_content_size {
                return Err(FetchError::ContentTooLarge(len as usize));
            }
        }

        let body = response.text().await?;
        if body.len() > self.max_content_size {
            return Err(FetchError::ContentTooLarge(body.len()));
        }

        Ok(FetchedBody {
            final_url,
            status_code: status.as_u16(),
            content_type,
            body,
        })
    }
}
