//! Processor metrics
//!
//! Counters for what the pipeline did and gauges for the queue's shape.
//! Dead-lettered items show up as a gauge since nothing else surfaces them.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::queue::QueueStats;

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a value
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for thread-safe value tracking
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Set the gauge value
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency histogram with fixed buckets
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries in microseconds
    buckets: Vec<u64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Observations above the last boundary
    overflow: AtomicU64,
    /// Sum of all values in microseconds
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets from 10ms to 60s, sized for network round trips
    pub fn new_latency() -> Self {
        let buckets = vec![
            10_000, 50_000, 100_000, 250_000, 500_000, 1_000_000, 2_500_000, 5_000_000, 10_000_000, 30_000_000,
            60_000_000,
        ];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            counts,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a duration
    pub fn observe(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &boundary) in self.buckets.iter().enumerate() {
            if micros <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the count of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the mean value in milliseconds
    pub fn mean_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    /// Get the overflow count
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Get bucket counts (non-cumulative)
    fn bucket_counts(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new_latency()
    }
}

/// All processor metrics
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    // Batch metrics
    pub batches_total: Counter,
    pub items_claimed: Counter,
    pub claims_lost: Counter,
    pub item_latency: Histogram,

    // Outcomes
    pub items_completed: Counter,
    pub items_failed: Counter,
    pub items_rejected: Counter,
    pub items_requeued: Counter,
    pub items_reclaimed: Counter,

    // Fetching
    pub pages_fetched: Counter,
    pub stylesheets_fetched: Counter,
    pub stylesheet_fetch_errors: Counter,
    pub fetch_latency: Histogram,

    // Cache
    pub cache_writes: Counter,
    pub cache_dedup_hits: Counter,
    pub bytes_saved: Counter,

    // Queue shape, refreshed after each batch
    pub queue_pending: Gauge,
    pub queue_processing: Gauge,
    pub queue_completed: Gauge,
    pub queue_error: Gauge,
    pub dead_lettered: Gauge,
}

impl ProcessorMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shareable metrics instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Refresh the queue gauges
    pub fn record_queue_stats(&self, stats: &QueueStats) {
        self.queue_pending.set(stats.pending as u64);
        self.queue_processing.set(stats.processing as u64);
        self.queue_completed.set(stats.completed as u64);
        self.queue_error.set(stats.error as u64);
        self.dead_lettered.set(stats.dead_lettered as u64);
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_total: self.batches_total.get(),
            items_claimed: self.items_claimed.get(),
            claims_lost: self.claims_lost.get(),
            item_latency_ms: self.item_latency.mean_ms(),

            items_completed: self.items_completed.get(),
            items_failed: self.items_failed.get(),
            items_rejected: self.items_rejected.get(),
            items_requeued: self.items_requeued.get(),
            items_reclaimed: self.items_reclaimed.get(),

            pages_fetched: self.pages_fetched.get(),
            stylesheets_fetched: self.stylesheets_fetched.get(),
            stylesheet_fetch_errors: self.stylesheet_fetch_errors.get(),
            fetch_latency_ms: self.fetch_latency.mean_ms(),

            cache_writes: self.cache_writes.get(),
            cache_dedup_hits: self.cache_dedup_hits.get(),
            bytes_saved: self.bytes_saved.get(),

            queue_pending: self.queue_pending.get(),
            queue_processing: self.queue_processing.get(),
            queue_completed: self.queue_completed.get(),
            queue_error: self.queue_error.get(),
            dead_lettered: self.dead_lettered.get(),
        }
    }

    /// Export in Prometheus exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        write_counter(&mut out, "usedcss_batches_total", "Batches run", self.batches_total.get());
        write_counter(&mut out, "usedcss_items_claimed_total", "Items claimed for processing", self.items_claimed.get());
        write_counter(&mut out, "usedcss_claims_lost_total", "Claims lost to a concurrent worker", self.claims_lost.get());
        write_histogram(&mut out, "usedcss_item_latency_seconds", "Time to process one item", &self.item_latency);

        write_counter(&mut out, "usedcss_items_completed_total", "Items optimized", self.items_completed.get());
        write_counter(&mut out, "usedcss_items_failed_total", "Recoverable item failures", self.items_failed.get());
        write_counter(&mut out, "usedcss_items_rejected_total", "Items rejected as invalid", self.items_rejected.get());
        write_counter(&mut out, "usedcss_items_requeued_total", "Errored items returned to pending", self.items_requeued.get());
        write_counter(&mut out, "usedcss_items_reclaimed_total", "Stale processing items reclaimed", self.items_reclaimed.get());

        write_counter(&mut out, "usedcss_pages_fetched_total", "Pages fetched", self.pages_fetched.get());
        write_counter(&mut out, "usedcss_stylesheets_fetched_total", "Stylesheets fetched", self.stylesheets_fetched.get());
        write_counter(&mut out, "usedcss_stylesheet_fetch_errors_total", "Stylesheet fetches skipped after an error", self.stylesheet_fetch_errors.get());
        write_histogram(&mut out, "usedcss_fetch_latency_seconds", "HTTP fetch latency", &self.fetch_latency);

        write_counter(&mut out, "usedcss_cache_writes_total", "Cache entries written", self.cache_writes.get());
        write_counter(&mut out, "usedcss_cache_dedup_hits_total", "Results already present in the cache", self.cache_dedup_hits.get());
        write_counter(&mut out, "usedcss_bytes_saved_total", "Stylesheet bytes removed by optimization", self.bytes_saved.get());

        write_gauge(&mut out, "usedcss_queue_pending", "Pending items", self.queue_pending.get());
        write_gauge(&mut out, "usedcss_queue_processing", "Items being processed", self.queue_processing.get());
        write_gauge(&mut out, "usedcss_queue_completed", "Completed items", self.queue_completed.get());
        write_gauge(&mut out, "usedcss_queue_error", "Errored items", self.queue_error.get());
        write_gauge(&mut out, "usedcss_dead_lettered", "Items out of retries awaiting manual reset", self.dead_lettered.get());

        out
    }
}

/// Write a counter metric in Prometheus exposition format
fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

/// Write a gauge metric in Prometheus exposition format
fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

/// Write a histogram metric in Prometheus exposition format
fn write_histogram(out: &mut String, name: &str, help: &str, hist: &Histogram) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} histogram", name);

    let mut cumulative: u64 = 0;
    for (boundary, count) in hist.buckets.iter().zip(hist.bucket_counts()) {
        cumulative += count;
        let le_seconds = *boundary as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_bucket{{le=\"{:.3}\"}} {}", name, le_seconds, cumulative);
    }
    let total = hist.count();
    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, total);
    let _ = writeln!(out, "{}_sum {:.6}", name, hist.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0);
    let _ = writeln!(out, "{}_count {}", name, total);
    let _ = writeln!(out);
}

/// Point-in-time snapshot of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_total: u64,
    pub items_claimed: u64,
    pub claims_lost: u64,
    pub item_latency_ms: f64,

    pub items_completed: u64,
    pub items_failed: u64,
    pub items_rejected: u64,
    pub items_requeued: u64,
    pub items_reclaimed: u64,

    pub pages_fetched: u64,
    pub stylesheets_fetched: u64,
    pub stylesheet_fetch_errors: u64,
    pub fetch_latency_ms: f64,

    pub cache_writes: u64,
    pub cache_dedup_hits: u64,
    pub bytes_saved: u64,

    pub queue_pending: u64,
    pub queue_processing: u64,
    pub queue_completed: u64,
    pub queue_error: u64,
    pub dead_lettered: u64,
}

/// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Record to histogram and return elapsed
    pub fn record(self, histogram: &Histogram) -> Duration {
        let elapsed = self.start.elapsed();
        histogram.observe(elapsed);
        elapsed
    }
}
