//! A "prelude" for users of the `spider-flow` crate.
//!
//! This prelude re-exports the most commonly used traits, structs, and helpers
//! so that they can be easily imported.
//!
//! # Example
//!
//! ```
//! use spider_flow::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Crawler,
    CrawlerBuilder,
    CrawlerConfig,
    OutputErrorPolicy,
    // Core traits
    Downloader,
    Spider,
    // Essential re-exports for trait implementation
    async_trait,
};

pub use crate::binding::{BoundArgs, Signature};
pub use crate::error::{BindingError, SpiderError, TransportError};
pub use crate::middleware::{DownloaderMiddleware, MiddlewareAction, SpiderMiddleware};
pub use crate::output::{self, Item, Output, OutputStream, RequestStream};
pub use crate::request::{CbKwargs, Request};
pub use crate::response::Response;
pub use crate::sink::{FailureRecord, ItemSink, LogSink};
pub use crate::spider::Callbacks;
pub use crate::stats::{StatCollector, StatsSink};
