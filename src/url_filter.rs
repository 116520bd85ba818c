//! Queue URL validation
//!
//! Anything rejected here is a permanent failure: retrying cannot make an
//! unparseable or disallowed URL acceptable.

use regex::Regex;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlRejection {
    #[error("invalid URL: {0}")]
    Invalid(String),
    #[error("unsupported URL scheme: {0}")]
    Scheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("URL matches disallowed pattern {0}")]
    Disallowed(String),
}

/// Compiled disallow list
#[derive(Debug, Clone)]
pub struct UrlFilter {
    disallowed: Vec<Regex>,
}

impl UrlFilter {
    /// Compile the patterns; invalid ones are logged and skipped
    /// (configuration validation reports them before we get here).
    pub fn new(patterns: &[String]) -> Self {
        let disallowed = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!("Invalid disallowed pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();
        Self { disallowed }
    }

    /// Parse and vet a queued URL
    pub fn check(&self, raw: &str) -> Result<Url, UrlRejection> {
        let url = Url::parse(raw.trim()).map_err(|e| UrlRejection::Invalid(e.to_string()))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(UrlRejection::Scheme(url.scheme().to_string()));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(UrlRejection::MissingHost);
        }

        if let Some(pattern) = self.disallowed.iter().find(|p| p.is_match(url.as_str())) {
            return Err(UrlRejection::Disallowed(pattern.as_str().to_string()));
        }

        Ok(url)
    }
}
