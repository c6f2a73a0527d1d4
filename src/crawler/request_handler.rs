//! Contains the request handling logic for the crawler.
//!
//! This module implements the downloader stage and the task that feeds it:
//!
//! - `DownloaderStage::process` runs one request through the downloader
//!   middleware pre hooks, the fetch collaborator and the post hooks.
//! - `RequestQueue` is how requests enter the pipeline, whether they come
//!   from the start sequence or from callback output.
//! - `spawn_downloader_task` receives queued requests and runs each one
//!   through download and dispatch on its own task, bounded by
//!   `max_concurrent_downloads`.

use crate::crawler::middleware_manager::{
    Direction, MiddlewareChain, ProcessException, ProcessRequest, ProcessResponse,
};
use crate::crawler::response_parser::{Outlets, SpiderStage};
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::middleware::{DownloaderMiddleware, MiddlewareAction};
use crate::request::Request;
use crate::response::Response;
use crate::spider::Spider;
use crate::state::CrawlerState;
use crate::stats::{counters, StatsSink};

use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, error, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// What became of a request after the downloader stage.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// A response ready for dispatch.
    Response(Response),
    /// A middleware discarded the request or its response.
    Dropped,
    /// A middleware asked for the request to be submitted again.
    Retry(Request, Duration),
}

/// Wraps the fetch collaborator with the downloader middleware chain.
pub struct DownloaderStage {
    downloader: Arc<dyn Downloader>,
    middlewares: Arc<MiddlewareChain<dyn DownloaderMiddleware>>,
    stats: Arc<dyn StatsSink>,
}

impl DownloaderStage {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        middlewares: Arc<MiddlewareChain<dyn DownloaderMiddleware>>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            downloader,
            middlewares,
            stats,
        }
    }

    /// Runs `request` through pre hooks, fetch and post hooks.
    ///
    /// The returned response owns the request that went through every hook,
    /// so its `cb_kwargs` carry all mutations made on the way.
    pub async fn process(&self, request: Request) -> Result<DownloadOutcome, SpiderError> {
        trace!("Processing request through downloader middlewares: {}", request.url);
        let original_url = request.url.clone();

        let response = match self
            .middlewares
            .run(Direction::Forward, request, &ProcessRequest)
            .await?
        {
            MiddlewareAction::Continue(request) => match self.fetch(request).await? {
                MiddlewareAction::Continue(response) | MiddlewareAction::ReturnResponse(response) => {
                    response
                }
                MiddlewareAction::Drop => return Ok(self.dropped(&original_url)),
                MiddlewareAction::Retry(request, delay) => return Ok(self.retry(*request, delay)),
            },
            MiddlewareAction::ReturnResponse(mut response) => {
                trace!("Request middleware answered {} without fetching", response.url);
                response.short_circuited = true;
                self.stats.increment(counters::DOWNLOADER_SHORT_CIRCUIT_COUNT, 1);
                response
            }
            MiddlewareAction::Drop => return Ok(self.dropped(&original_url)),
            MiddlewareAction::Retry(request, delay) => return Ok(self.retry(*request, delay)),
        };

        trace!("Processing response through downloader middlewares: {}", response.url);
        match self
            .middlewares
            .run_replacing(Direction::Reverse, response, &ProcessResponse)
            .await?
        {
            MiddlewareAction::Continue(response) | MiddlewareAction::ReturnResponse(response) => {
                Ok(DownloadOutcome::Response(response))
            }
            MiddlewareAction::Drop => Ok(self.dropped(&original_url)),
            MiddlewareAction::Retry(request, delay) => Ok(self.retry(*request, delay)),
        }
    }

    // Continue carries a fetched response; a failed fetch goes through the
    // exception hooks, which may recover with ReturnResponse.
    async fn fetch(&self, request: Request) -> Result<MiddlewareAction<Response>, SpiderError> {
        self.stats.increment(counters::DOWNLOADER_REQUEST_COUNT, 1);
        match self.downloader.download(request).await {
            Ok(response) => {
                self.stats.increment(counters::DOWNLOADER_RESPONSE_COUNT, 1);
                Ok(MiddlewareAction::Continue(response))
            }
            Err(failure) => {
                self.stats.increment(counters::DOWNLOADER_EXCEPTION_COUNT, 1);
                debug!("Download error for {}: {}", failure.request.url, failure.reason);
                let hook = ProcessException {
                    reason: failure.reason.clone(),
                };
                match self
                    .middlewares
                    .run(Direction::Reverse, *failure.request, &hook)
                    .await?
                {
                    MiddlewareAction::Continue(request) => Err(SpiderError::Transport {
                        url: request.url.to_string(),
                        reason: failure.reason,
                    }),
                    MiddlewareAction::ReturnResponse(response) => {
                        debug!("Exception middleware recovered {}", response.url);
                        Ok(MiddlewareAction::ReturnResponse(response))
                    }
                    MiddlewareAction::Drop => Ok(MiddlewareAction::Drop),
                    MiddlewareAction::Retry(request, delay) => {
                        Ok(MiddlewareAction::Retry(request, delay))
                    }
                }
            }
        }
    }

    fn dropped(&self, url: &url::Url) -> DownloadOutcome {
        debug!("Request dropped by middleware for URL: {}", url);
        self.stats.increment(counters::REQUESTS_DROPPED, 1);
        DownloadOutcome::Dropped
    }

    fn retry(&self, request: Request, delay: Duration) -> DownloadOutcome {
        debug!("Middleware scheduled retry for URL: {} after {:?}", request.url, delay);
        self.stats.increment(counters::REQUESTS_RETRIED, 1);
        DownloadOutcome::Retry(request, delay)
    }
}

/// The entry point for requests into the pipeline.
#[derive(Clone)]
pub struct RequestQueue {
    tx: AsyncSender<Request>,
    state: Arc<CrawlerState>,
    stats: Arc<dyn StatsSink>,
}

impl RequestQueue {
    pub(crate) fn new(
        tx: AsyncSender<Request>,
        state: Arc<CrawlerState>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self { tx, state, stats }
    }

    /// Queues `request` for the downloader stage.
    pub async fn submit(&self, request: Request) -> Result<(), SpiderError> {
        trace!("Enqueuing request: {}", request.url);
        self.state.pending_requests.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(request).await {
            self.state.pending_requests.fetch_sub(1, Ordering::SeqCst);
            return Err(SpiderError::GeneralError(format!(
                "request channel closed: {}",
                e
            )));
        }
        self.stats.increment(counters::REQUESTS_ENQUEUED, 1);
        Ok(())
    }

    /// Closes the channel for every holder; later submissions fail.
    pub(crate) fn close(&self) {
        let _ = self.tx.close();
    }
}

pub(crate) fn spawn_downloader_task<S>(
    req_rx: AsyncReceiver<Request>,
    downloader_stage: Arc<DownloaderStage>,
    spider_stage: Arc<SpiderStage<S>>,
    outlets: Outlets,
    state: Arc<CrawlerState>,
    max_concurrent_downloads: usize,
) -> tokio::task::JoinHandle<()>
where
    S: Spider,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent_downloads));

    tokio::spawn(async move {
        trace!(
            "Downloader task started with max_concurrent_downloads: {}",
            max_concurrent_downloads
        );
        let mut tasks = JoinSet::new();

        while let Ok(request) = req_rx.recv().await {
            trace!("Received request for URL: {}", request.url);
            if state.is_aborted() {
                state.pending_requests.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    warn!("Download semaphore closed, stopping downloader task.");
                    break;
                }
            };

            let downloader_stage = Arc::clone(&downloader_stage);
            let spider_stage = Arc::clone(&spider_stage);
            let outlets = outlets.clone();
            let state = Arc::clone(&state);

            tasks.spawn(async move {
                handle_request(request, &downloader_stage, &spider_stage, &outlets).await;
                state.pending_requests.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });

            // reap finished tasks so the set does not grow with the crawl
            while let Some(res) = tasks.try_join_next() {
                if let Err(e) = res {
                    error!("A download task failed: {:?}", e);
                }
            }
        }

        trace!("Waiting for active download tasks to complete");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("A download task failed: {:?}", e);
            }
        }
        trace!("Downloader task finished");
    })
}

// download -> dispatch -> deliver, strictly in sequence for one request
async fn handle_request<S: Spider>(
    request: Request,
    downloader_stage: &DownloaderStage,
    spider_stage: &SpiderStage<S>,
    outlets: &Outlets,
) {
    let url = request.url.clone();
    let response = match downloader_stage.process(request).await {
        Ok(DownloadOutcome::Response(response)) => response,
        Ok(DownloadOutcome::Dropped) => return,
        Ok(DownloadOutcome::Retry(request, delay)) => {
            tokio::time::sleep(delay).await;
            if let Err(e) = outlets.requests.submit(request).await {
                error!("Failed to re-enqueue retried request for URL {}: {}", url, e);
            }
            return;
        }
        Err(e) => {
            error!("Error downloading {}: {}", url, e);
            return;
        }
    };

    if let Err(e) = spider_stage.process_and_deliver(response, outlets).await {
        error!("Fatal error while dispatching {}: {}", url, e);
        outlets.abort(e);
    }
}
