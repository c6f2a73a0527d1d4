//! # Statistics Module
//!
//! Collects counters about the crawl.
//!
//! ## Overview
//!
//! The pipeline only ever increments named counters through the
//! [`StatsSink`] trait; it never reads them back. [`StatCollector`] is the
//! default sink: a concurrent map of counters that spiders may also bump
//! (e.g. a callback counting the checks it made) and that can be exported as
//! JSON or Markdown at any time.
//!
//! ## Example
//!
//! ```rust
//! use spider_flow::stats::{StatCollector, StatsSink};
//!
//! let stats = StatCollector::new();
//! stats.increment("boolean_checks", 2);
//! stats.increment("boolean_checks", 1);
//! assert_eq!(stats.get_value("boolean_checks"), Some(3));
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::SpiderError;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Counter names the engine increments.
pub mod counters {
    pub const START_REQUESTS: &str = "start_requests";
    pub const REQUESTS_ENQUEUED: &str = "requests_enqueued";
    pub const REQUESTS_DROPPED: &str = "requests_dropped";
    pub const REQUESTS_RETRIED: &str = "requests_retried";
    pub const DOWNLOADER_REQUEST_COUNT: &str = "downloader/request_count";
    pub const DOWNLOADER_RESPONSE_COUNT: &str = "downloader/response_count";
    pub const DOWNLOADER_EXCEPTION_COUNT: &str = "downloader/exception_count";
    pub const DOWNLOADER_SHORT_CIRCUIT_COUNT: &str = "downloader/short_circuit_count";
    pub const RESPONSES_DISPATCHED: &str = "responses_dispatched";
    pub const SPIDER_EXCEPTIONS_BINDING: &str = "spider_exceptions/binding";
    pub const SPIDER_EXCEPTIONS_CALLBACK: &str = "spider_exceptions/callback";
    pub const SPIDER_EXCEPTIONS_MIDDLEWARE: &str = "spider_exceptions/middleware";
    pub const ITEMS_SCRAPED: &str = "items_scraped";
    pub const ITEMS_PROCESSED: &str = "items_processed";
    pub const ITEMS_DROPPED: &str = "items_dropped";
}

/// Where the pipeline reports counts. Fire-and-forget.
pub trait StatsSink: Send + Sync + 'static {
    fn increment(&self, counter: &str, amount: usize);

    /// Current counter values, for reporting only. Sinks that forward counts
    /// elsewhere may leave this empty.
    fn snapshot(&self) -> BTreeMap<String, usize> {
        BTreeMap::new()
    }
}

// A point-in-time copy used by every export.
struct StatsSnapshot {
    counters: BTreeMap<String, usize>,
    elapsed_duration: Duration,
}

impl StatsSnapshot {
    fn formatted_duration(&self) -> String {
        format!("{:?}", self.elapsed_duration)
    }

    fn per_second(&self, counter: &str) -> f64 {
        let total_seconds = self.elapsed_duration.as_secs_f64();
        let value = self.counters.get(counter).copied().unwrap_or(0);
        if total_seconds > 0.0 {
            value as f64 / total_seconds
        } else {
            0.0
        }
    }
}

/// The default in-memory stats sink.
#[derive(Debug)]
pub struct StatCollector {
    pub start_time: Instant,
    counters: DashMap<String, usize>,
}

impl StatCollector {
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            counters: DashMap::new(),
        }
    }

    /// The current value of a counter, if it was ever incremented.
    pub fn get_value(&self, counter: &str) -> Option<usize> {
        self.counters.get(counter).map(|v| *v.value())
    }

    /// All counters, sorted by name.
    pub fn counters(&self) -> BTreeMap<String, usize> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn report_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: self.counters(),
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    /// Converts the counters into a JSON string.
    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string(&self.counters())?)
    }

    /// Converts the counters into a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string_pretty(&self.counters())?)
    }

    /// Exports the current statistics to a Markdown formatted string.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.report_snapshot();

        let rows: String = snapshot
            .counters
            .iter()
            .map(|(name, count)| format!("| {} | {} |", name, count))
            .collect::<Vec<String>>()
            .join("\n");
        let table = if rows.is_empty() {
            "| N/A | 0 |".to_string()
        } else {
            rows
        };

        format!(
            r#"# Crawl Statistics Report

- **Duration**: {}
- **Average Speed**: {:.2} req/s, {:.2} resp/s, {:.2} item/s

## Counters
| Counter | Value |
|---------|-------|
{}
"#,
            snapshot.formatted_duration(),
            snapshot.per_second(counters::DOWNLOADER_REQUEST_COUNT),
            snapshot.per_second(counters::DOWNLOADER_RESPONSE_COUNT),
            snapshot.per_second(counters::ITEMS_SCRAPED),
            table
        )
    }
}

impl StatsSink for StatCollector {
    fn increment(&self, counter: &str, amount: usize) {
        // get_mut first so the common case does not allocate the key
        if let Some(mut value) = self.counters.get_mut(counter) {
            *value += amount;
            return;
        }
        *self.counters.entry(counter.to_string()).or_insert(0) += amount;
    }

    fn snapshot(&self) -> BTreeMap<String, usize> {
        self.counters()
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.report_snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {}", snapshot.formatted_duration())?;
        writeln!(
            f,
            "  speed    : req/s: {:.2}, resp/s: {:.2}, item/s: {:.2}",
            snapshot.per_second(counters::DOWNLOADER_REQUEST_COUNT),
            snapshot.per_second(counters::DOWNLOADER_RESPONSE_COUNT),
            snapshot.per_second(counters::ITEMS_SCRAPED)
        )?;
        for (name, count) in &snapshot.counters {
            writeln!(f, "  {} : {}", name, count)?;
        }
        Ok(())
    }
}
