//! Queue processor
//!
//! Drives one batch at a time: sweep abandoned and backed-off items, claim
//! eligible ones, then run the fetch/extract/match/minify pipeline for each.
//! Every per-item failure becomes a state transition on that item; only a
//! failure to read the queue itself aborts a batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheError, CacheStore, CacheWrite};
use crate::config::{Config, QueueConfig};
use crate::extractor::extract_stylesheets;
use crate::fetcher::{FetchError, FetchedBody, PageFetcher};
use crate::matcher::{PageDom, UsageMatcher};
use crate::metrics::{ProcessorMetrics, Timer};
use crate::minify::minify;
use crate::queue::{QueueStore, StoreError};
use crate::types::{ContentHash, ItemStatus, QueueItem, Transition, TransitionError};
use crate::url_filter::{UrlFilter, UrlRejection};

/// Failure classes, each with its own retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Bad or disallowed URL; never retried
    Validation,
    /// Transport, timeout or non-2xx
    Fetch,
    /// Page or stylesheets yielded nothing usable
    Content,
    /// Cache write failed
    Storage,
}

/// Why one item could not be optimized
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlRejection),
    #[error("failed to fetch page: {0}")]
    Fetch(#[from] FetchError),
    #[error("empty response")]
    EmptyResponse,
    #[error("no stylesheets")]
    NoStylesheets,
    #[error("no CSS content processed")]
    NoCssContent,
    #[error("cache write failed: {0}")]
    Cache(#[from] CacheError),
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) => ErrorKind::Validation,
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::EmptyResponse | Self::NoStylesheets | Self::NoCssContent => ErrorKind::Content,
            Self::Cache(_) => ErrorKind::Storage,
        }
    }

    /// Permanent failures dead-letter the item at once
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

/// Settings the processor needs, lifted out of [`Config`]
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub queue: QueueConfig,
    /// Upper bound on any single fetch
    pub fetch_timeout: Duration,
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue.clone(),
            fetch_timeout: config.fetch.timeout(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What one batch did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Stale `processing` items moved to error
    pub reclaimed: usize,
    /// Errored items whose backoff elapsed, moved back to pending
    pub requeued: usize,
    /// Eligible items returned by the store
    pub selected: usize,
    /// Items another worker claimed first
    pub claims_lost: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items dead-lettered by validation
    pub rejected: usize,
    /// Items whose final state could not be written
    pub store_errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Rejected => self.rejected += 1,
            ItemOutcome::ClaimLost => self.claims_lost += 1,
            ItemOutcome::StoreError => self.store_errors += 1,
        }
    }
}

enum ItemOutcome {
    Completed,
    Failed,
    Rejected,
    ClaimLost,
    StoreError,
}

/// Successful pipeline result for one page
#[derive(Debug, Clone)]
pub struct OptimizedCss {
    pub css: String,
    pub hash: ContentHash,
    /// Stylesheets that contributed rules
    pub sources: usize,
    /// Total size of the fetched stylesheets
    pub original_bytes: usize,
}

/// Background processor for the used-CSS queue
pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    cache: Arc<dyn CacheStore>,
    fetcher: Arc<dyn PageFetcher>,
    filter: UrlFilter,
    config: ProcessorConfig,
    metrics: Arc<ProcessorMetrics>,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        cache: Arc<dyn CacheStore>,
        fetcher: Arc<dyn PageFetcher>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            filter: UrlFilter::new(&config.queue.disallowed_patterns),
            store,
            cache,
            fetcher,
            config,
            metrics: ProcessorMetrics::shared(),
        }
    }

    pub fn metrics(&self) -> &Arc<ProcessorMetrics> {
        &self.metrics
    }

    /// Run one batch of at most `limit` items
    pub async fn process_batch(&self, limit: usize) -> Result<BatchReport, StoreError> {
        let max_retries = self.config.queue.max_retries;
        let mut report = BatchReport {
            reclaimed: self.reclaim_stale()?,
            requeued: self.requeue_due()?,
            ..BatchReport::default()
        };

        let items = self.store.select_pending(limit, max_retries)?;
        report.selected = items.len();
        debug!("Selected {} pending items", items.len());

        let outcomes: Vec<ItemOutcome> = stream::iter(items)
            .map(|item| self.run_item(item))
            .buffered(self.config.queue.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        self.metrics.batches_total.inc();
        match self.store.stats(max_retries) {
            Ok(stats) => self.metrics.record_queue_stats(&stats),
            Err(e) => warn!("Failed to refresh queue stats: {}", e),
        }

        if report.selected > 0 || report.reclaimed > 0 || report.requeued > 0 {
            info!(
                "Batch done: {} completed, {} failed, {} rejected, {} lost claims ({} requeued, {} reclaimed)",
                report.completed, report.failed, report.rejected, report.claims_lost, report.requeued, report.reclaimed
            );
        }
        Ok(report)
    }

    /// Move `processing` items untouched for longer than `stale_after` to error
    pub fn reclaim_stale(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        // A cutoff before the representable range means nothing can be stale
        let Some(stale_before) = cutoff(now, self.config.queue.stale_after()) else {
            return Ok(0);
        };

        let mut reclaimed = 0;
        for item in self.store.scan(ItemStatus::Processing)? {
            if item.modified >= stale_before {
                continue;
            }
            match self.store.update(item.id, &Transition::Abandon { stale_before }, now) {
                Ok(updated) => {
                    warn!("Reclaimed stale item {} ({}), retries now {}", item.id, item.url, updated.retries);
                    self.metrics.items_reclaimed.inc();
                    reclaimed += 1;
                }
                // Finished or reclaimed by someone else in the meantime
                Err(StoreError::Transition(TransitionError::Invalid { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Return errored items to pending once their backoff has elapsed
    pub fn requeue_due(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let max_retries = self.config.queue.max_retries;

        let mut requeued = 0;
        for item in self.store.scan(ItemStatus::Error)? {
            if item.retries >= max_retries || !self.backoff_elapsed(&item, now) {
                continue;
            }
            match self.store.update(item.id, &Transition::Requeue { max_retries }, now) {
                Ok(_) => {
                    debug!("Requeued item {} after {} failures", item.id, item.retries);
                    self.metrics.items_requeued.inc();
                    requeued += 1;
                }
                Err(StoreError::Transition(TransitionError::Invalid { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    fn backoff_elapsed(&self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        cutoff(now, self.config.queue.backoff_for(item.retries)).is_some_and(|due| item.modified <= due)
    }

    async fn run_item(&self, item: QueueItem) -> ItemOutcome {
        let id = item.id;
        match self.store.claim(id, Utc::now()) {
            Ok(true) => self.metrics.items_claimed.inc(),
            Ok(false) => {
                debug!("Item {} was claimed by another worker", id);
                self.metrics.claims_lost.inc();
                return ItemOutcome::ClaimLost;
            }
            Err(e) => {
                error!("Failed to claim item {}: {}", id, e);
                return ItemOutcome::StoreError;
            }
        }

        let timer = Timer::start();
        let result = self.optimize(&item.url).await;
        let elapsed = timer.record(&self.metrics.item_latency);

        let (transition, outcome) = match result {
            Ok(optimized) => {
                info!(
                    "Optimized {} in {:?}: {} -> {} bytes from {} stylesheet(s)",
                    item.url,
                    elapsed,
                    optimized.original_bytes,
                    optimized.css.len(),
                    optimized.sources
                );
                self.metrics.items_completed.inc();
                self.metrics
                    .bytes_saved
                    .add(optimized.original_bytes.saturating_sub(optimized.css.len()) as u64);
                (
                    Transition::Complete {
                        css: optimized.css,
                        hash: optimized.hash,
                    },
                    ItemOutcome::Completed,
                )
            }
            Err(e) if e.is_permanent() => {
                warn!("Rejected item {} ({}): {}", id, item.url, e);
                self.metrics.items_rejected.inc();
                (
                    Transition::Reject {
                        message: e.to_string(),
                        max_retries: self.config.queue.max_retries,
                    },
                    ItemOutcome::Rejected,
                )
            }
            Err(e) => {
                warn!(
                    "Failed item {} ({}) attempt {}: {}",
                    id,
                    item.url,
                    item.retries + 1,
                    e
                );
                self.metrics.items_failed.inc();
                (Transition::Fail { message: e.to_string() }, ItemOutcome::Failed)
            }
        };

        match self.store.update(id, &transition, Utc::now()) {
            Ok(_) => outcome,
            Err(e) => {
                // Left in processing; the stale sweep will pick it up
                error!("Failed to record {} for item {}: {}", transition.name(), id, e);
                ItemOutcome::StoreError
            }
        }
    }

    /// Run the pipeline for one page URL and write the result to the cache
    pub async fn optimize(&self, raw_url: &str) -> Result<OptimizedCss, ProcessError> {
        let url = self.filter.check(raw_url)?;

        let page = self.fetch(&url).await?;
        self.metrics.pages_fetched.inc();
        if page.is_empty() {
            return Err(ProcessError::EmptyResponse);
        }

        let sheet_urls = extract_stylesheets(&page.body, &page.final_url);
        if sheet_urls.is_empty() {
            return Err(ProcessError::NoStylesheets);
        }

        // Sequential on purpose: bounds outbound requests per page
        let mut sheets = Vec::with_capacity(sheet_urls.len());
        for sheet_url in sheet_urls {
            match self.fetch(&sheet_url).await {
                Ok(body) if !body.is_empty() => {
                    self.metrics.stylesheets_fetched.inc();
                    sheets.push((sheet_url, body.body));
                }
                Ok(_) => debug!("Skipping empty stylesheet {}", sheet_url),
                Err(e) => {
                    warn!("Skipping stylesheet {}: {}", sheet_url, e);
                    self.metrics.stylesheet_fetch_errors.inc();
                }
            }
        }

        let optimized = assemble_used_css(&page.body, &sheets).ok_or(ProcessError::NoCssContent)?;

        match self.cache.write(&optimized.hash, optimized.css.as_bytes())? {
            CacheWrite::Written => self.metrics.cache_writes.inc(),
            CacheWrite::AlreadyPresent => self.metrics.cache_dedup_hits.inc(),
        }
        Ok(optimized)
    }

    async fn fetch(&self, url: &Url) -> Result<FetchedBody, FetchError> {
        let limit = self.config.fetch_timeout;
        let timer = Timer::start();
        let result = match tokio::time::timeout(limit, self.fetcher.get(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(limit)),
        };
        timer.record(&self.metrics.fetch_latency);
        result
    }
}

/// Filter every stylesheet against the page and join the survivors, each
/// block tagged with its source URL. `None` when nothing survives.
pub fn assemble_used_css(html: &str, sheets: &[(Url, String)]) -> Option<OptimizedCss> {
    let dom = PageDom::parse(html);
    let mut matcher = UsageMatcher::new(&dom);

    let mut combined = String::new();
    let mut sources = 0;
    let mut original_bytes = 0;
    for (url, css) in sheets {
        original_bytes += css.len();
        let filtered = matcher.filter(css);
        debug!(
            "{}: kept {} rules, dropped {} ({} kept unparsed)",
            url, filtered.kept, filtered.dropped, filtered.fail_open
        );

        let used = minify(&filtered.css);
        if used.is_empty() {
            continue;
        }
        combined.push_str(&source_tag(url));
        combined.push('\n');
        combined.push_str(&used);
        combined.push('\n');
        sources += 1;
    }

    let css = minify(&combined);
    if css.is_empty() {
        return None;
    }
    Some(OptimizedCss {
        hash: ContentHash::compute(&css),
        css,
        sources,
        original_bytes,
    })
}

/// The instant `age` before `now`, if it is representable
fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

/// Preserved comment naming a stylesheet; `*/` in the URL cannot end it early
fn source_tag(url: &Url) -> String {
    format!("/*! source: {} */", url.as_str().replace("*/", "*%2F"))
}
