//! Integration tests for usedcss
//!
//! These drive the queue processor end to end against a scripted fetcher.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use usedcss::{
    cache::{CacheStore, FsCacheStore},
    config::QueueConfig,
    extractor::extract_stylesheets,
    fetcher::{FetchError, FetchedBody, PageFetcher},
    processor::{ProcessorConfig, QueueProcessor},
    queue::{MemoryQueueStore, QueueStore, SledQueueStore},
    types::{ContentHash, ItemStatus, Transition},
};

#[derive(Clone)]
enum Reply {
    Body(&'static str),
    Status(u16),
    Hang,
}

/// Fetcher that answers from a table and records every request
#[derive(Default)]
struct ScriptedFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    requests: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn reply(&self, url: &str, reply: Reply) -> &Self {
        self.replies.lock().insert(url.to_string(), reply);
        self
    }

    fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|u| u.as_str() == url).count()
    }

    fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn get(&self, url: &Url) -> Result<FetchedBody, FetchError> {
        self.requests.lock().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.replies.lock().get(url.as_str()).cloned();
        match reply {
            Some(Reply::Body(body)) => Ok(FetchedBody {
                final_url: url.clone(),
                status_code: 200,
                content_type: None,
                body: body.to_string(),
            }),
            Some(Reply::Status(code)) => Err(FetchError::Status(code)),
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(FetchError::Status(404)),
        }
    }
}

const PAGE: &str = r#"<!DOCTYPE html>
<html><head>
  <link rel="stylesheet" href="/style.css">
  <link rel="stylesheet" href="https://cdn.example.net/lib.css">
</head>
<body><main class="content"><p>Hello</p></main></body></html>"#;

const STYLE: &str = "body { color: red; }\n.unused { color: blue; }\n/* layout */\n.content p { margin: 0 }";
const LIB: &str = "@media (max-width:600px){.x{display:none}}\n.widget{float:left}";

fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        queue: QueueConfig {
            retry_backoff_secs: 0,
            max_backoff_secs: 0,
            ..QueueConfig::default()
        },
        fetch_timeout: Duration::from_millis(100),
    }
}

struct Harness {
    _tmp: TempDir,
    store: Arc<MemoryQueueStore>,
    cache: Arc<FsCacheStore>,
    fetcher: Arc<ScriptedFetcher>,
    processor: QueueProcessor,
}

fn harness(fetcher: ScriptedFetcher, config: ProcessorConfig) -> Harness {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let cache = Arc::new(FsCacheStore::open(tmp.path().join("used-css")).unwrap());
    let fetcher = Arc::new(fetcher);
    let processor = QueueProcessor::new(store.clone(), cache.clone(), fetcher.clone(), config);
    Harness {
        _tmp: tmp,
        store,
        cache,
        fetcher,
        processor,
    }
}

fn site_fetcher() -> ScriptedFetcher {
    let fetcher = ScriptedFetcher::new();
    fetcher
        .reply("https://example.com/", Reply::Body(PAGE))
        .reply("https://example.com/style.css", Reply::Body(STYLE))
        .reply("https://cdn.example.net/lib.css", Reply::Body(LIB));
    fetcher
}

/// Relative and absolute stylesheet links both resolve to absolute URLs
#[test]
fn test_extractor_resolves_links() {
    let page = Url::parse("https://example.com/blog/").unwrap();
    let urls: Vec<String> = extract_stylesheets(PAGE, &page)
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(
        urls,
        vec!["https://example.com/style.css", "https://cdn.example.net/lib.css"]
    );
}

#[tokio::test]
async fn test_batch_completes_item_and_writes_cache() {
    let h = harness(site_fetcher(), test_config());
    let id = h.store.enqueue("https://example.com/", Utc::now()).unwrap().id();

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.completed, 1);

    let item = h.store.get(id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.retries, 0);
    assert!(item.error_message.is_none());

    let css = item.css.unwrap();
    let hash = item.hash.unwrap();
    assert_eq!(hash, ContentHash::compute(&css));

    assert!(css.contains("body{color:red}"));
    assert!(css.contains(".content p{margin:0}"));
    assert!(!css.contains(".unused"));
    assert!(!css.contains(".widget"));
    assert!(css.contains("@media (max-width:600px){.x{display:none}}"));
    assert!(css.contains("/*! source: https://example.com/style.css */"));
    assert!(css.contains("/*! source: https://cdn.example.net/lib.css */"));
    assert!(!css.contains("layout"));

    let cached = h.cache.read(&hash).unwrap().unwrap();
    assert_eq!(cached, css.as_bytes());
}

#[tokio::test]
async fn test_page_timeout_records_error() {
    let fetcher = ScriptedFetcher::new();
    fetcher.reply("https://slow.example.com/", Reply::Hang);
    let h = harness(fetcher, test_config());
    let id = h.store.enqueue("https://slow.example.com/", Utc::now()).unwrap().id();

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.failed, 1);

    let item = h.store.get(id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Error);
    assert_eq!(item.retries, 1);
    assert!(item.error_message.unwrap().contains("Timeout"));
    assert!(item.css.is_none() && item.hash.is_none());
}

#[tokio::test]
async fn test_three_failures_dead_letter_item() {
    let fetcher = ScriptedFetcher::new();
    fetcher.reply("https://down.example.com/", Reply::Status(503));
    let h = harness(fetcher, test_config());
    let id = h.store.enqueue("https://down.example.com/", Utc::now()).unwrap().id();

    for attempt in 1..=3u32 {
        let report = h.processor.process_batch(5).await.unwrap();
        assert_eq!(report.failed, 1, "attempt {attempt}");
        assert_eq!(h.store.get(id).unwrap().unwrap().retries, attempt);
    }

    assert!(h.store.select_pending(5, 3).unwrap().is_empty());
    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.selected, 0);
    assert_eq!(report.requeued, 0);

    let item = h.store.get(id).unwrap().unwrap();
    assert!(item.is_dead_lettered(3));
    assert_eq!(h.fetcher.total_requests(), 3);
    assert_eq!(h.store.stats(3).unwrap().dead_lettered, 1);
    assert_eq!(h.processor.metrics().snapshot().dead_lettered, 1);
}

#[tokio::test]
async fn test_identical_output_shares_cache_entry() {
    let fetcher = site_fetcher();
    fetcher.reply("https://example.com/other", Reply::Body(PAGE));
    let h = harness(fetcher, test_config());
    let a = h.store.enqueue("https://example.com/", Utc::now()).unwrap().id();
    let b = h.store.enqueue("https://example.com/other", Utc::now()).unwrap().id();

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.completed, 2);

    let first = h.store.get(a).unwrap().unwrap();
    let second = h.store.get(b).unwrap().unwrap();
    assert_eq!(first.hash, second.hash);
    assert_eq!(h.cache.entry_count().unwrap(), 1);

    let snapshot = h.processor.metrics().snapshot();
    assert_eq!(snapshot.cache_writes, 1);
    assert_eq!(snapshot.cache_dedup_hits, 1);
}

#[tokio::test]
async fn test_validation_failures_dead_letter_without_fetching() {
    let h = harness(ScriptedFetcher::new(), test_config());
    let robots = h.store.enqueue("https://example.com/robots.txt", Utc::now()).unwrap().id();
    let junk = h.store.enqueue("not a url", Utc::now()).unwrap().id();
    let ftp = h.store.enqueue("ftp://example.com/", Utc::now()).unwrap().id();

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.rejected, 3);
    assert_eq!(h.fetcher.total_requests(), 0);

    for id in [robots, junk, ftp] {
        let item = h.store.get(id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Error);
        assert!(item.is_dead_lettered(3));
    }
    let robots_item = h.store.get(robots).unwrap().unwrap();
    assert!(robots_item.error_message.unwrap().contains("disallowed"));
}

#[tokio::test]
async fn test_failed_stylesheet_is_skipped() {
    let fetcher = ScriptedFetcher::new();
    fetcher
        .reply("https://example.com/", Reply::Body(PAGE))
        .reply("https://example.com/style.css", Reply::Body(STYLE))
        .reply("https://cdn.example.net/lib.css", Reply::Status(500));
    let h = harness(fetcher, test_config());
    let id = h.store.enqueue("https://example.com/", Utc::now()).unwrap().id();

    h.processor.process_batch(5).await.unwrap();

    let item = h.store.get(id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    let css = item.css.unwrap();
    assert!(css.contains("body{color:red}"));
    assert!(!css.contains("lib.css"));
    assert_eq!(h.processor.metrics().snapshot().stylesheet_fetch_errors, 1);
}

#[tokio::test]
async fn test_content_errors_are_recoverable() {
    let fetcher = ScriptedFetcher::new();
    fetcher
        .reply("https://a.example.com/", Reply::Body("   \n"))
        .reply("https://b.example.com/", Reply::Body("<html><body><p>no css</p></body></html>"))
        .reply(
            "https://c.example.com/",
            Reply::Body(r#"<link rel="stylesheet" href="/s.css"><p>x</p>"#),
        )
        .reply("https://c.example.com/s.css", Reply::Body(".missing{color:red}"));
    let h = harness(fetcher, test_config());
    let now = Utc::now();
    let a = h.store.enqueue("https://a.example.com/", now).unwrap().id();
    let b = h.store.enqueue("https://b.example.com/", now).unwrap().id();
    let c = h.store.enqueue("https://c.example.com/", now).unwrap().id();

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.failed, 3);

    let message = |id| h.store.get(id).unwrap().unwrap().error_message.unwrap();
    assert_eq!(message(a), "empty response");
    assert_eq!(message(b), "no stylesheets");
    assert_eq!(message(c), "no CSS content processed");

    for id in [a, b, c] {
        let item = h.store.get(id).unwrap().unwrap();
        assert_eq!(item.retries, 1);
        assert!(!item.is_dead_lettered(3));
    }
}

#[tokio::test]
async fn test_failure_does_not_abort_batch_and_order_is_fifo() {
    let fetcher = site_fetcher();
    fetcher.reply("https://broken.example.com/", Reply::Status(500));
    let h = harness(fetcher, test_config());
    let now = Utc::now();
    let broken = h.store.enqueue("https://broken.example.com/", now).unwrap().id();
    let good = h.store.enqueue("https://example.com/", now).unwrap().id();

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!((report.failed, report.completed), (1, 1));
    assert_eq!(h.store.get(broken).unwrap().unwrap().status, ItemStatus::Error);
    assert_eq!(h.store.get(good).unwrap().unwrap().status, ItemStatus::Completed);

    let requests = h.fetcher.requests.lock().clone();
    assert_eq!(requests[0], "https://broken.example.com/");
    assert_eq!(requests[1], "https://example.com/");
}

#[tokio::test]
async fn test_batch_limit_is_respected() {
    let h = harness(site_fetcher(), test_config());
    for i in 0..4 {
        h.store
            .enqueue(&format!("https://example.com/?page={i}"), Utc::now())
            .unwrap();
    }

    let report = h.processor.process_batch(2).await.unwrap();
    assert_eq!(report.selected, 2);
    assert_eq!(h.store.stats(3).unwrap().pending, 2);
}

#[tokio::test]
async fn test_parallel_batch_processes_everything() {
    let fetcher = ScriptedFetcher::with_delay(Duration::from_millis(5));
    fetcher
        .reply("https://example.com/style.css", Reply::Body(STYLE))
        .reply("https://cdn.example.net/lib.css", Reply::Body(LIB));
    let urls = [
        "https://example.com/a",
        "https://example.com/b",
        "https://example.com/c",
        "https://example.com/d",
    ];
    for url in urls {
        fetcher.reply(url, Reply::Body(PAGE));
    }

    let config = ProcessorConfig {
        queue: QueueConfig {
            concurrency: 3,
            ..test_config().queue
        },
        ..test_config()
    };
    let h = harness(fetcher, config);
    for url in urls {
        h.store.enqueue(url, Utc::now()).unwrap();
    }

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.completed, 4);
    assert_eq!(h.cache.entry_count().unwrap(), 1);
}

#[tokio::test]
async fn test_overlapping_batches_never_process_an_item_twice() {
    let fetcher = ScriptedFetcher::with_delay(Duration::from_millis(10));
    fetcher
        .reply("https://example.com/style.css", Reply::Body(STYLE))
        .reply("https://cdn.example.net/lib.css", Reply::Body(LIB));
    let urls = ["https://example.com/1", "https://example.com/2", "https://example.com/3"];
    for url in urls {
        fetcher.reply(url, Reply::Body(PAGE));
    }

    let h = harness(fetcher, test_config());
    for url in urls {
        h.store.enqueue(url, Utc::now()).unwrap();
    }
    let second = QueueProcessor::new(h.store.clone(), h.cache.clone(), h.fetcher.clone(), test_config());

    let (a, b) = tokio::join!(h.processor.process_batch(5), second.process_batch(5));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.completed + b.completed, 3);
    assert_eq!(a.claims_lost + b.claims_lost, a.selected + b.selected - 3);
    for url in urls {
        assert_eq!(h.fetcher.requests_for(url), 1, "{url} fetched more than once");
    }
}

#[tokio::test]
async fn test_stale_processing_item_is_reclaimed() {
    let h = harness(site_fetcher(), test_config());
    let id = h.store.enqueue("https://example.com/", Utc::now()).unwrap().id();

    // A worker claimed it two hours ago and never finished
    assert!(h.store.claim(id, Utc::now() - ChronoDuration::hours(2)).unwrap());

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.completed, 1);

    let item = h.store.get(id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.retries, 1);
}

#[tokio::test]
async fn test_fresh_processing_item_is_left_alone() {
    let h = harness(site_fetcher(), test_config());
    let id = h.store.enqueue("https://example.com/", Utc::now()).unwrap().id();
    assert!(h.store.claim(id, Utc::now()).unwrap());

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.selected, 0);
    assert_eq!(h.store.get(id).unwrap().unwrap().status, ItemStatus::Processing);
}

#[tokio::test]
async fn test_huge_delays_do_not_break_batches() {
    let fetcher = ScriptedFetcher::new();
    fetcher.reply("https://down.example.com/", Reply::Status(502));
    let h = harness(
        fetcher,
        ProcessorConfig {
            queue: QueueConfig {
                stale_after_secs: 10_000_000_000_000,
                retry_backoff_secs: u64::MAX,
                max_backoff_secs: u64::MAX,
                ..QueueConfig::default()
            },
            fetch_timeout: Duration::from_millis(100),
        },
    );
    let id = h.store.enqueue("https://down.example.com/", Utc::now()).unwrap().id();
    let stuck = h.store.enqueue("https://example.com/stuck", Utc::now()).unwrap().id();
    assert!(h.store.claim(stuck, Utc::now() - ChronoDuration::days(365)).unwrap());

    let first = h.processor.process_batch(5).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.reclaimed, 0);

    let second = h.processor.process_batch(5).await.unwrap();
    assert_eq!((second.reclaimed, second.requeued, second.selected), (0, 0, 0));
    assert_eq!(h.store.get(id).unwrap().unwrap().status, ItemStatus::Error);
    assert_eq!(h.store.get(stuck).unwrap().unwrap().status, ItemStatus::Processing);
}

#[tokio::test]
async fn test_backoff_delays_retry() {
    let fetcher = ScriptedFetcher::new();
    fetcher.reply("https://down.example.com/", Reply::Status(502));
    let h = harness(
        fetcher,
        ProcessorConfig {
            queue: QueueConfig::default(),
            fetch_timeout: Duration::from_millis(100),
        },
    );
    let id = h.store.enqueue("https://down.example.com/", Utc::now()).unwrap().id();

    h.processor.process_batch(5).await.unwrap();
    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.selected, 0);
    assert_eq!(h.store.get(id).unwrap().unwrap().retries, 1);
}

#[tokio::test]
async fn test_reset_revives_dead_lettered_item() {
    let fetcher = ScriptedFetcher::new();
    fetcher.reply("https://example.com/", Reply::Status(503));
    let h = harness(fetcher, test_config());
    let id = h.store.enqueue("https://example.com/", Utc::now()).unwrap().id();

    for _ in 0..3 {
        h.processor.process_batch(5).await.unwrap();
    }
    assert!(h.store.get(id).unwrap().unwrap().is_dead_lettered(3));

    h.fetcher
        .reply("https://example.com/", Reply::Body(PAGE))
        .reply("https://example.com/style.css", Reply::Body(STYLE))
        .reply("https://cdn.example.net/lib.css", Reply::Body(LIB));
    let reset = h.store.update(id, &Transition::Reset, Utc::now()).unwrap();
    assert_eq!((reset.status, reset.retries), (ItemStatus::Pending, 0));

    let report = h.processor.process_batch(5).await.unwrap();
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn test_sled_store_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let fetcher = Arc::new(site_fetcher());
    let cache = Arc::new(FsCacheStore::open(tmp.path().join("cache")).unwrap());

    let id = {
        let store = Arc::new(SledQueueStore::open(tmp.path().join("data")).unwrap());
        let id = store.enqueue("https://example.com/", Utc::now()).unwrap().id();
        let processor = QueueProcessor::new(store.clone(), cache.clone(), fetcher.clone(), test_config());
        let report = processor.process_batch(5).await.unwrap();
        assert_eq!(report.completed, 1);
        store.flush().unwrap();
        id
    };

    let reopened = SledQueueStore::open(tmp.path().join("data")).unwrap();
    let item = reopened.get(id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    let hash = item.hash.unwrap();
    assert!(cache.contains(&hash).unwrap());
}
