//! Module for tracking the operational state of the crawler.
//!
//! `CrawlerState` holds the atomic counters the engine uses to decide when a
//! crawl has become idle:
//! - requests submitted to the downloader stage and not yet fully dispatched,
//! - scraped items still travelling through the item sinks,
//! - whether the start request sequence has been exhausted.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Represents the shared state of the crawler's tasks.
#[derive(Debug, Default)]
pub struct CrawlerState {
    /// Requests queued or in flight through download and dispatch.
    pub pending_requests: AtomicUsize,
    /// Items currently being processed by the item sinks.
    pub processing_items: AtomicUsize,
    /// Set once the start sequence has been fully pulled.
    pub start_exhausted: AtomicBool,
    /// Set when a failure must stop the whole crawl.
    pub aborted: AtomicBool,
}

impl CrawlerState {
    /// Creates a new, atomically reference-counted `CrawlerState`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Checks if all crawler activities are idle.
    pub fn is_idle(&self) -> bool {
        self.start_exhausted.load(Ordering::SeqCst)
            && self.pending_requests.load(Ordering::SeqCst) == 0
            && self.processing_items.load(Ordering::SeqCst) == 0
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}
