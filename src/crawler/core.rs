//! The core Crawler implementation for the `spider-flow` engine.
//!
//! This module defines the `Crawler` struct, which acts as the central orchestrator
//! for a crawl. It ties together the spider, the fetch collaborator, both
//! middleware chains and the item sinks, manages the lifecycle of requests
//! and items, handles concurrency, and reports statistics.
//!
//! It utilizes a task-based asynchronous model, spawning distinct tasks for
//! pulling the start requests, downloading and dispatching requests, and
//! processing scraped items.

use crate::builder::CrawlerConfig;
use crate::crawler::item_processor::spawn_item_processor_task;
use crate::crawler::middleware_manager::{Direction, MiddlewareChain};
use crate::crawler::periodic_log::spawn_periodic_log_task;
use crate::crawler::request_handler::{spawn_downloader_task, DownloaderStage, RequestQueue};
use crate::crawler::response_parser::{Outlets, SpiderStage};
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::middleware::{DownloaderMiddleware, SpiderMiddleware};
use crate::output::RequestStream;
use crate::sink::{ItemSink, LogSink};
use crate::spider::Spider;
use crate::state::CrawlerState;
use crate::stats::{counters, StatsSink};
use futures_util::future::join_all;
use futures_util::StreamExt;
use kanal::bounded_async;
use tracing::{debug, error, info, trace, warn};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// The central orchestrator for a crawl.
pub struct Crawler<S: Spider> {
    spider: Arc<S>,
    downloader: Arc<dyn Downloader>,
    downloader_middlewares: Arc<MiddlewareChain<dyn DownloaderMiddleware>>,
    spider_middlewares: Arc<MiddlewareChain<dyn SpiderMiddleware>>,
    item_sinks: Arc<Vec<Box<dyn ItemSink>>>,
    stats: Arc<dyn StatsSink>,
    log_sink: Arc<dyn LogSink>,
    config: CrawlerConfig,
}

impl<S: Spider> Crawler<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        spider: S,
        downloader: Arc<dyn Downloader>,
        downloader_middlewares: MiddlewareChain<dyn DownloaderMiddleware>,
        spider_middlewares: MiddlewareChain<dyn SpiderMiddleware>,
        item_sinks: Vec<Box<dyn ItemSink>>,
        stats: Arc<dyn StatsSink>,
        log_sink: Arc<dyn LogSink>,
        config: CrawlerConfig,
    ) -> Self {
        Crawler {
            spider: Arc::new(spider),
            downloader,
            downloader_middlewares: Arc::new(downloader_middlewares),
            spider_middlewares: Arc::new(spider_middlewares),
            item_sinks: Arc::new(item_sinks),
            stats,
            log_sink,
            config,
        }
    }

    /// Runs the crawl until it becomes idle, Ctrl-C is received, or a
    /// failure stops it.
    ///
    /// Returns the error that stopped the crawl, if any. Failures that only
    /// concern a single request or response are logged and do not surface
    /// here.
    pub async fn start_crawl(self) -> Result<(), SpiderError> {
        let Crawler {
            spider,
            downloader,
            downloader_middlewares,
            spider_middlewares,
            item_sinks,
            stats,
            log_sink,
            config,
        } = self;

        info!(
            "Crawler starting spider '{}' with configuration: max_concurrent_downloads={}, max_concurrent_pipelines={}, output_error_policy={:?}",
            spider.name(),
            config.max_concurrent_downloads,
            config.max_concurrent_pipelines,
            config.output_error_policy
        );

        let state = CrawlerState::new();

        trace!(
            "Creating communication channels with item capacity: {}",
            config.channel_capacity
        );
        // Unbounded: download tasks submit into it while holding a permit.
        let (req_tx, req_rx) = kanal::unbounded_async();
        let (item_tx, item_rx) = bounded_async(config.channel_capacity);

        let queue = RequestQueue::new(req_tx, Arc::clone(&state), Arc::clone(&stats));
        let outlets = Outlets::new(
            queue.clone(),
            item_tx,
            Arc::clone(&state),
            Arc::clone(&stats),
        );

        let periodic_log = config
            .periodic_log
            .clone()
            .filter(|p| p.is_enabled())
            .map(|p| spawn_periodic_log_task(p, Arc::clone(&stats)));

        trace!("Spawning item processor task");
        let item_processor_task = spawn_item_processor_task(
            Arc::clone(&state),
            item_rx,
            Arc::clone(&item_sinks),
            config.max_concurrent_pipelines,
            Arc::clone(&stats),
        );

        trace!("Spawning downloader task");
        let downloader_stage = Arc::new(DownloaderStage::new(
            downloader,
            downloader_middlewares,
            Arc::clone(&stats),
        ));
        let spider_stage = Arc::new(SpiderStage::new(
            Arc::clone(&spider),
            Arc::clone(&spider_middlewares),
            Arc::clone(&stats),
            log_sink,
            config.output_error_policy,
        ));
        let downloader_task = spawn_downloader_task(
            req_rx,
            downloader_stage,
            spider_stage,
            outlets.clone(),
            Arc::clone(&state),
            config.max_concurrent_downloads,
        );

        trace!("Spawning start requests task");
        let start_task = spawn_start_requests_task(
            spider,
            spider_middlewares,
            queue.clone(),
            Arc::clone(&state),
            Arc::clone(&stats),
            config.channel_capacity,
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, initiating graceful shutdown.");
            }
            _ = async {
                loop {
                    if state.is_aborted() {
                        break;
                    }
                    if state.is_idle() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        if state.is_idle() {
                            break;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            } => {
                if state.is_aborted() {
                    warn!("Crawl aborted, initiating shutdown.");
                } else {
                    info!("Crawl has become idle, initiating shutdown.");
                }
            }
        };

        state.aborted.store(true, Ordering::SeqCst);
        trace!("Closing request channel");
        queue.close();
        drop(queue);

        let fatal = outlets.fatal_slot();
        let abort_handles = [
            start_task.abort_handle(),
            downloader_task.abort_handle(),
            item_processor_task.abort_handle(),
        ];
        let timeout_duration = Duration::from_secs(config.shutdown_timeout_secs);
        let drained = tokio::time::timeout(timeout_duration, async move {
            for (name, task) in [("start requests", start_task), ("downloader", downloader_task)] {
                if let Err(e) = task.await {
                    error!("The {} task failed during shutdown: {}", name, e);
                }
            }
            // the item channel closes with the last outlet
            drop(outlets);
            if let Err(e) = item_processor_task.await {
                error!("The item processor task failed during shutdown: {}", e);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Tasks did not complete within timeout ({}s), aborting remaining tasks and continuing with shutdown...",
                timeout_duration.as_secs()
            );
            for handle in abort_handles {
                handle.abort();
            }
        } else {
            trace!("All tasks completed during shutdown");
        }

        if let Some((stop_tx, handle)) = periodic_log {
            let _ = stop_tx.send(());
            match handle.await {
                Ok(written) => debug!("Periodic log wrote {} entries", written),
                Err(e) => error!("Periodic log task failed: {}", e),
            }
        }

        info!("Closing item sinks...");
        let closing_futures: Vec<_> = item_sinks.iter().map(|s| s.close()).collect();
        join_all(closing_futures).await;
        debug!("All item sinks closed");

        let snapshot = stats.snapshot();
        info!(
            "Crawl finished. Stats: {}",
            serde_json::to_string(&snapshot).unwrap_or_default()
        );

        let fatal = fatal.lock().ok().and_then(|mut slot| slot.take());
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the stats sink used by this crawler.
    pub fn get_stats(&self) -> Arc<dyn StatsSink> {
        Arc::clone(&self.stats)
    }
}

/// Wraps the start sequence with every `process_start` hook. Nothing is
/// pulled here; each request passes all hooks before the next is produced.
fn filter_start_requests<'a>(
    start: RequestStream<'a>,
    middlewares: &'a MiddlewareChain<dyn SpiderMiddleware>,
) -> RequestStream<'a> {
    let mut start = start;
    // nearest-the-spider middleware wraps the raw sequence first
    for middleware in middlewares.iter(Direction::Reverse) {
        trace!("process_start via {}", middleware.name());
        start = middleware.process_start(start);
    }
    start
}

fn spawn_start_requests_task<S: Spider>(
    spider: Arc<S>,
    middlewares: Arc<MiddlewareChain<dyn SpiderMiddleware>>,
    queue: RequestQueue,
    state: Arc<CrawlerState>,
    stats: Arc<dyn StatsSink>,
    max_pending: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut start = filter_start_requests(spider.start_requests(), &middlewares);

        while let Some(request) = start.next().await {
            while state.pending_requests.load(Ordering::SeqCst) >= max_pending {
                if state.is_aborted() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if state.is_aborted() {
                debug!("Crawl stopping, no more start requests are pulled");
                break;
            }
            stats.increment(counters::START_REQUESTS, 1);
            if let Err(e) = queue.submit(request).await {
                error!("Failed to enqueue start request: {}", e);
                break;
            }
        }
        state.start_exhausted.store(true, Ordering::SeqCst);
        trace!("Start requests task finished");
    })
}
