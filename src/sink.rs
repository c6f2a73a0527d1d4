//! Sinks for what leaves the pipeline: scraped items and failure records.

use crate::error::SpiderError;
use crate::output::Item;
use async_trait::async_trait;
use tracing::{error, info};

/// Receives scraped items. Sinks run in registration order; returning
/// `Ok(None)` drops the item before later sinks see it.
#[async_trait]
pub trait ItemSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_item(&self, item: Item) -> Result<Option<Item>, SpiderError>;

    /// Called once when the crawl ends.
    async fn close(&self) {}
}

/// Logs every item. Installed when no other sink is configured.
#[derive(Debug, Default)]
pub struct LogItemSink;

impl LogItemSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ItemSink for LogItemSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn process_item(&self, item: Item) -> Result<Option<Item>, SpiderError> {
        info!("Scraped item: {}", item);
        Ok(Some(item))
    }
}

/// A dispatch failure that did not stop the crawl.
#[derive(Debug)]
pub struct FailureRecord {
    pub callback: String,
    pub url: String,
    pub error: SpiderError,
}

impl FailureRecord {
    /// The error kind, e.g. `UnexpectedArgumentError`.
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

/// Receives failures the crawl logged and moved past.
pub trait LogSink: Send + Sync + 'static {
    fn record(&self, failure: FailureRecord);
}

/// Emits each failure as a `tracing` error event.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, failure: FailureRecord) {
        error!(
            callback = %failure.callback,
            url = %failure.url,
            kind = failure.kind(),
            "Spider error processing {}: {}",
            failure.url,
            failure.error
        );
    }
}
