//! Lazy sequences flowing out of spiders and middlewares.
//!
//! Start requests and callback output are modelled as boxed streams. They are
//! pulled once, in order, and each element is produced only when the consumer
//! asks for it, so a hook that mutates an element does so before the next
//! one exists.

use crate::error::SpiderError;
use crate::request::Request;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::time::Duration;

/// A scraped item. Opaque to the pipeline and forwarded to the item sinks.
pub type Item = Value;

/// One element produced by a callback.
#[derive(Debug, Clone)]
pub enum Output {
    /// Re-submitted to the downloader stage.
    Request(Request),
    /// Forwarded to the item sinks.
    Item(Item),
}

impl Output {
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Output::Request(r) => Some(r),
            Output::Item(_) => None,
        }
    }

    pub fn as_request_mut(&mut self) -> Option<&mut Request> {
        match self {
            Output::Request(r) => Some(r),
            Output::Item(_) => None,
        }
    }
}

impl From<Request> for Output {
    fn from(request: Request) -> Self {
        Output::Request(request)
    }
}

impl From<Item> for Output {
    fn from(item: Item) -> Self {
        Output::Item(item)
    }
}

/// The lazy output of a callback after the spider output hooks.
pub type OutputStream<'a> = BoxStream<'a, Result<Output, SpiderError>>;

/// The lazy sequence of start requests.
pub type RequestStream<'a> = BoxStream<'a, Request>;

/// A callback output with nothing in it.
pub fn empty<'a>() -> OutputStream<'a> {
    stream::empty().boxed()
}

/// A callback output holding a single element.
pub fn once<'a>(output: impl Into<Output>) -> OutputStream<'a> {
    stream::once(futures_util::future::ready(Ok(output.into()))).boxed()
}

/// A callback output produced lazily from an iterator.
pub fn from_iter<'a, I>(outputs: I) -> OutputStream<'a>
where
    I: IntoIterator + 'a,
    I::IntoIter: Send + 'a,
    I::Item: Into<Output>,
{
    stream::iter(outputs.into_iter().map(|o| Ok(o.into()))).boxed()
}

/// A callback output that yields `request` once `delay` has passed. The
/// wait starts when the element is pulled.
pub fn delayed<'a>(request: Request, delay: Duration) -> OutputStream<'a> {
    stream::once(async move {
        tokio::time::sleep(delay).await;
        Ok(Output::Request(request))
    })
    .boxed()
}

/// A callback output that fails as soon as it is pulled.
pub fn failed<'a>(error: SpiderError) -> OutputStream<'a> {
    stream::once(futures_util::future::ready(Err(error))).boxed()
}

/// Start requests produced lazily from an iterator.
pub fn requests<'a, I>(requests: I) -> RequestStream<'a>
where
    I: IntoIterator<Item = Request> + 'a,
    I::IntoIter: Send + 'a,
{
    stream::iter(requests).boxed()
}
