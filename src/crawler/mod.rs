//! # Crawler Module
//!
//! Implements the engine that moves requests and responses through the
//! middleware chains and the spider's callbacks.
//!
//! ## Overview
//!
//! The crawler module provides the main `Crawler` struct and the two stages
//! every request passes through:
//!
//! - **DownloaderStage**: downloader middleware pre hooks, the fetch
//!   collaborator, then the post hooks in reverse
//! - **SpiderStage**: spider middleware input hooks, callback binding and
//!   dispatch, then the output hooks over the lazy callback output
//! - **MiddlewareChain**: the priority-ordered chain both stages run their
//!   hooks through
//!
//! ## Architecture
//!
//! The crawler uses an asynchronous, task-based model where different operations
//! run concurrently in separate Tokio tasks. Communication between components
//! happens through async channels. A request is handled start to finish
//! (download, dispatch, delivery of its outputs) by a single task, so the
//! stages for one request never overlap.
//!
//! ## Internal Components
//!
//! These are implementation details and are not typically used directly:
//! - `spawn_downloader_task`: receives queued requests and runs each on its own task
//! - `spawn_item_processor_task`: hands scraped items to the item sinks
//! - `spawn_periodic_log_task`: logs counters at a fixed interval

mod core;
mod item_processor;
mod middleware_manager;
mod periodic_log;
mod request_handler;
mod response_parser;

pub use core::Crawler;
pub use middleware_manager::{
    Direction, Hook, MiddlewareChain, ProcessException, ProcessRequest, ProcessResponse,
    ProcessSpiderInput,
};
pub use periodic_log::{NameFilter, PeriodicLogConfig};
pub use request_handler::{DownloadOutcome, DownloaderStage, RequestQueue};
pub use response_parser::SpiderStage;
