//! usedcss: per-page used-CSS extraction
//!
//! A background pipeline that, for each queued page URL, fetches the page
//! and its linked stylesheets, keeps only the rules whose selectors match the
//! page's DOM, minifies the result and stores it in a content-addressed cache:
//! - Durable work queue with atomic claim, retry backoff and stale reclaim
//! - Lenient HTML parsing and a small selector compiler with fail-open fallback
//! - Idempotent minifier that preserves `/*! */` source tags
//! - SHA256-keyed cache shared by pages with identical output

pub mod cache;
pub mod config;
pub mod daemon;
pub mod extractor;
pub mod fetcher;
pub mod matcher;
pub mod metrics;
pub mod minify;
pub mod processor;
pub mod queue;
pub mod types;
pub mod url_filter;

pub use config::Config;
pub use types::*;
