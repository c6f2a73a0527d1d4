//! # Builder Module
//!
//! Provides the `CrawlerBuilder`, a fluent API for constructing and configuring
//! `Crawler` instances, and the `CrawlerConfig` it fills in.
//!
//! ## Overview
//!
//! The builder assembles a spider, a fetch collaborator, both middleware
//! chains, the item sinks and the stats and log sinks into a ready-to-run
//! crawler. Settings can be given one by one or loaded as a whole from TOML.
//!
//! ## Key Features
//!
//! - **Concurrency Configuration**: Control the number of concurrent
//!   downloads and item sink tasks
//! - **Middleware Registration**: Downloader and spider middlewares are
//!   registered with an explicit priority; lower runs first on the way in
//! - **Failure Policy**: Choose whether an output hook error ends only the
//!   current response or the whole crawl
//! - **Default Handling**: A logging item sink and a `StatCollector` are
//!   installed when none are provided
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_flow::prelude::*;
//!
//! async fn setup_crawler() -> Result<(), SpiderError> {
//!     let crawler = CrawlerBuilder::new(MySpider, MyDownloader)
//!         .max_concurrent_downloads(10)
//!         .add_downloader_middleware(750, InjectArguments)
//!         .add_spider_middleware(750, MarkStart)
//!         .build()?;
//!
//!     crawler.start_crawl().await
//! }
//! ```

use crate::crawler::{Crawler, MiddlewareChain, PeriodicLogConfig};
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::middleware::{DownloaderMiddleware, SpiderMiddleware};
use crate::sink::{ItemSink, LogItemSink, LogSink, TracingLogSink};
use crate::spider::Spider;
use crate::stats::{StatCollector, StatsSink};
use serde::Deserialize;
use std::sync::Arc;

/// What happens when an output hook yields an error element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputErrorPolicy {
    /// Log the error and discard the rest of that response's output.
    #[default]
    AbortResponse,
    /// Stop the crawl; `start_crawl` returns the error.
    AbortCrawl,
}

/// Configuration for the crawler's concurrency and failure handling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// The maximum number of requests downloaded and dispatched at once.
    pub max_concurrent_downloads: usize,
    /// The maximum number of items travelling through the sinks at once.
    pub max_concurrent_pipelines: usize,
    /// The capacity of the item channel, and the number of start requests
    /// allowed in flight before the start sequence is paused.
    pub channel_capacity: usize,
    pub output_error_policy: OutputErrorPolicy,
    /// How long shutdown waits for in-flight work.
    pub shutdown_timeout_secs: u64,
    pub periodic_log: Option<PeriodicLogConfig>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            max_concurrent_downloads: num_cpus::get().max(16),
            max_concurrent_pipelines: num_cpus::get().min(8),
            channel_capacity: 1000,
            output_error_policy: OutputErrorPolicy::default(),
            shutdown_timeout_secs: 30,
            periodic_log: None,
        }
    }
}

impl CrawlerConfig {
    /// Parses a configuration from TOML. Missing keys keep their defaults.
    ///
    /// ```
    /// use spider_flow::builder::{CrawlerConfig, OutputErrorPolicy};
    ///
    /// let config = CrawlerConfig::from_toml_str(r#"
    ///     max_concurrent_downloads = 4
    ///     output_error_policy = "abort_crawl"
    ///
    ///     [periodic_log]
    ///     interval_secs = 10.0
    ///     delta = { include = ["downloader/"] }
    /// "#).unwrap();
    /// assert_eq!(config.max_concurrent_downloads, 4);
    /// assert_eq!(config.output_error_policy, OutputErrorPolicy::AbortCrawl);
    /// assert!(config.periodic_log.unwrap().delta.is_some());
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, SpiderError> {
        Ok(toml::from_str(text)?)
    }

    fn validate(&self) -> Result<(), SpiderError> {
        if self.max_concurrent_downloads == 0 {
            return Err(SpiderError::ConfigurationError(
                "max_concurrent_downloads must be greater than 0.".to_string(),
            ));
        }
        if self.max_concurrent_pipelines == 0 {
            return Err(SpiderError::ConfigurationError(
                "max_concurrent_pipelines must be greater than 0.".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(SpiderError::ConfigurationError(
                "channel_capacity must be greater than 0.".to_string(),
            ));
        }
        if let Some(periodic) = &self.periodic_log {
            if periodic.interval_secs.is_nan() || periodic.interval_secs <= 0.0 {
                return Err(SpiderError::ConfigurationError(
                    "periodic_log.interval_secs must be greater than 0.".to_string(),
                ));
            }
        }
        Ok(())
    }
}

pub struct CrawlerBuilder<S: Spider> {
    crawler_config: CrawlerConfig,
    spider: S,
    downloader: Arc<dyn Downloader>,
    downloader_middlewares: MiddlewareChain<dyn DownloaderMiddleware>,
    spider_middlewares: MiddlewareChain<dyn SpiderMiddleware>,
    item_sinks: Vec<Box<dyn ItemSink>>,
    stats: Option<Arc<dyn StatsSink>>,
    log_sink: Arc<dyn LogSink>,
}

impl<S: Spider> CrawlerBuilder<S> {
    /// Creates a new `CrawlerBuilder` for a spider and the fetch collaborator
    /// it will use.
    pub fn new<D: Downloader>(spider: S, downloader: D) -> Self {
        Self {
            crawler_config: CrawlerConfig::default(),
            spider,
            downloader: Arc::new(downloader),
            downloader_middlewares: MiddlewareChain::new(),
            spider_middlewares: MiddlewareChain::new(),
            item_sinks: Vec::new(),
            stats: None,
            log_sink: Arc::new(TracingLogSink),
        }
    }

    /// Replaces the whole configuration, e.g. one loaded from TOML.
    pub fn config(mut self, config: CrawlerConfig) -> Self {
        self.crawler_config = config;
        self
    }

    /// Sets the maximum number of concurrent downloads.
    pub fn max_concurrent_downloads(mut self, limit: usize) -> Self {
        self.crawler_config.max_concurrent_downloads = limit;
        self
    }

    /// Sets the maximum number of concurrent item sink tasks.
    pub fn max_concurrent_pipelines(mut self, limit: usize) -> Self {
        self.crawler_config.max_concurrent_pipelines = limit;
        self
    }

    /// Sets the capacity of communication channels between components.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.crawler_config.channel_capacity = capacity;
        self
    }

    pub fn output_error_policy(mut self, policy: OutputErrorPolicy) -> Self {
        self.crawler_config.output_error_policy = policy;
        self
    }

    /// Enables the periodic stats log.
    pub fn periodic_log(mut self, config: PeriodicLogConfig) -> Self {
        self.crawler_config.periodic_log = Some(config);
        self
    }

    /// Registers a downloader middleware. Equal priorities keep registration
    /// order.
    pub fn add_downloader_middleware<M>(mut self, priority: i32, middleware: M) -> Self
    where
        M: DownloaderMiddleware,
    {
        self.downloader_middlewares
            .register(priority, Box::new(middleware));
        self
    }

    /// Registers a spider middleware. Equal priorities keep registration
    /// order.
    pub fn add_spider_middleware<M>(mut self, priority: i32, middleware: M) -> Self
    where
        M: SpiderMiddleware,
    {
        self.spider_middlewares.register(priority, Box::new(middleware));
        self
    }

    /// Appends an item sink. Sinks see each item in the order they were added.
    pub fn add_item_sink<P>(mut self, sink: P) -> Self
    where
        P: ItemSink,
    {
        self.item_sinks.push(Box::new(sink));
        self
    }

    /// Uses `stats` instead of a fresh `StatCollector`.
    pub fn with_stats<T: StatsSink>(mut self, stats: Arc<T>) -> Self {
        self.stats = Some(stats as Arc<dyn StatsSink>);
        self
    }

    /// Sets where binding and callback failures are recorded.
    pub fn with_log_sink<L: LogSink>(mut self, log_sink: Arc<L>) -> Self {
        self.log_sink = log_sink;
        self
    }

    /// Validates the configuration and builds the `Crawler`.
    pub fn build(mut self) -> Result<Crawler<S>, SpiderError> {
        self.crawler_config.validate()?;

        if self.item_sinks.is_empty() {
            self = self.add_item_sink(LogItemSink::new());
        }

        let stats: Arc<dyn StatsSink> = match self.stats {
            Some(stats) => stats,
            None => Arc::new(StatCollector::new()),
        };

        Ok(Crawler::new(
            self.spider,
            self.downloader,
            self.downloader_middlewares,
            self.spider_middlewares,
            self.item_sinks,
            stats,
            self.log_sink,
            self.crawler_config,
        ))
    }
}
