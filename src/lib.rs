//! # spider-flow
//!
//! The request/response orchestration core of a crawling engine.
//!
//! Requests produced by a spider pass through an ordered chain of downloader
//! middlewares, are fetched by an external [`Downloader`], come back through
//! the same chain in reverse and are dispatched to a named spider callback
//! through a chain of spider middlewares. Each request carries a keyword
//! argument bag (`cb_kwargs`) that every stage may read and mutate; at
//! dispatch time it is bound against the callback's declared [`Signature`].
//! Requests a callback yields loop back into the pipeline and everything
//! else goes to the item sinks.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_flow::prelude::*;
//! use std::sync::Arc;
//!
//! struct MySpider;
//!
//! impl MySpider {
//!     fn parse_detail(self: Arc<Self>, response: Response, args: BoundArgs) -> OutputStream<'static> {
//!         let key = args.get("key").cloned().unwrap_or_default();
//!         output::once(serde_json::json!({ "url": response.url.as_str(), "key": key }))
//!     }
//! }
//!
//! impl Spider for MySpider {
//!     fn name(&self) -> &str { "my-spider" }
//!
//!     fn start_requests(&self) -> RequestStream<'static> {
//!         let request = Request::get("https://example.com/").unwrap()
//!             .with_callback("parse_detail")
//!             .with_cb_kwargs(CbKwargs::new().with("key", "value"));
//!         output::requests(vec![request])
//!     }
//!
//!     fn callbacks(&self) -> Callbacks<Self> {
//!         Callbacks::new().register(Signature::new("parse_detail").required("key"), Self::parse_detail)
//!     }
//! }
//!
//! async fn run_crawler(downloader: impl Downloader) -> Result<(), SpiderError> {
//!     let crawler = CrawlerBuilder::new(MySpider, downloader).build()?;
//!     crawler.start_crawl().await
//! }
//! ```

pub mod binding;
pub mod builder;
pub mod crawler;
pub mod downloader;
pub mod error;
pub mod middleware;
pub mod output;
pub mod prelude;
pub mod request;
pub mod response;
pub mod sink;
pub mod spider;
pub mod state;
pub mod stats;

pub use binding::{BoundArgs, Signature};
pub use builder::{CrawlerBuilder, CrawlerConfig, OutputErrorPolicy};
pub use crawler::Crawler;
pub use downloader::Downloader;
pub use error::{BindingError, SpiderError, TransportError};
pub use request::{CbKwargs, Request};
pub use response::Response;
pub use spider::Spider;

pub use async_trait::async_trait;
pub use tokio;
