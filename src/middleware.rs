//! # Middleware Module
//!
//! The hook contracts for downloader and spider middlewares.
//!
//! ## Overview
//!
//! Middlewares are registered with an explicit integer priority. Lower
//! priorities run first on the way in (towards the fetcher or the callback)
//! and last on the way out, so every middleware wraps the ones registered
//! after it.
//!
//! - **Downloader middlewares** see each request before it is fetched
//!   (`process_request`), each response after it is fetched
//!   (`process_response`) and each transport failure (`process_exception`).
//! - **Spider middlewares** filter the start requests once at crawl start
//!   (`process_start`), see each response before its callback runs
//!   (`process_spider_input`) and transform the callback's output as it is
//!   pulled (`process_spider_output`).
//!
//! Every hook has a pass-through default, so a middleware only implements the
//! hooks it needs. Hooks take `&self`; a middleware holding state uses
//! interior mutability since hooks for different requests may run at the
//! same time.
//!
//! ## Example
//!
//! ```rust,ignore
//! struct InjectArguments;
//!
//! #[async_trait]
//! impl DownloaderMiddleware for InjectArguments {
//!     fn name(&self) -> &str { "inject-arguments" }
//!
//!     async fn process_request(&self, mut request: Request) -> Result<MiddlewareAction<Request>, SpiderError> {
//!         request.cb_kwargs.insert("from_process_request", true);
//!         Ok(MiddlewareAction::Continue(request))
//!     }
//! }
//! ```

use crate::error::SpiderError;
use crate::output::{OutputStream, RequestStream};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use std::time::Duration;

/// What a hook wants to happen next.
#[derive(Debug)]
pub enum MiddlewareAction<T> {
    /// Hand the (possibly mutated) value to the next hook.
    Continue(T),
    /// Re-submit the request after the given delay.
    Retry(Box<Request>, Duration),
    /// Discard the request or response.
    Drop,
    /// Answer with this response. Before the fetch this skips the remaining
    /// pre hooks and the fetch itself; in the post and input phases it
    /// replaces the response and the remaining hooks still run.
    ReturnResponse(Response),
}

impl<T> MiddlewareAction<T> {
    pub fn is_continue(&self) -> bool {
        matches!(self, MiddlewareAction::Continue(_))
    }
}

/// A middleware around the fetch stage.
#[async_trait]
pub trait DownloaderMiddleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Runs before the fetch, in ascending priority order.
    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        Ok(MiddlewareAction::Continue(request))
    }

    /// Runs after the fetch, in descending priority order.
    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        Ok(MiddlewareAction::Continue(response))
    }

    /// Runs when the fetch fails, in descending priority order. Returning
    /// `ReturnResponse` recovers; the response then goes through the
    /// `process_response` hooks.
    async fn process_exception(
        &self,
        request: Request,
        _reason: &str,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        Ok(MiddlewareAction::Continue(request))
    }
}

/// A middleware around callback dispatch.
#[async_trait]
pub trait SpiderMiddleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Wraps the start request sequence. Called once at crawl start; the
    /// returned stream must pull from `start` lazily.
    fn process_start<'a>(&'a self, start: RequestStream<'a>) -> RequestStream<'a> {
        start
    }

    /// Runs before the callback, in ascending priority order. An error
    /// prevents dispatch of this response only.
    async fn process_spider_input(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        Ok(MiddlewareAction::Continue(response))
    }

    /// Wraps the callback output, in descending priority order. The returned
    /// stream must pull from `output` lazily; it may borrow the middleware but
    /// not the response.
    fn process_spider_output<'a>(
        &'a self,
        _response: &Response,
        output: OutputStream<'a>,
    ) -> OutputStream<'a> {
        output
    }
}
