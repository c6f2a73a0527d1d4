//! The response envelope produced by the fetch collaborator.
//!
//! A `Response` owns the request it answers. Middlewares reach the request's
//! `cb_kwargs` through [`Response::request_mut`]; the response's own fields
//! are not meant to be rewritten once fetched.

use crate::error::SpiderError;
use crate::request::{CallbackRef, Request};
use bytes::Bytes;
use std::borrow::Cow;
use url::Url;

#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub body: Bytes,
    /// Set when a middleware answered the request instead of the fetcher.
    pub short_circuited: bool,
    request: Request,
}

impl Response {
    /// Builds a response for `request`, taking over the request's url.
    pub fn new(request: Request, status: u16, body: impl Into<Bytes>) -> Self {
        Response {
            url: request.url.clone(),
            status,
            body: body.into(),
            short_circuited: false,
            request,
        }
    }

    /// Overrides the response url, e.g. after a redirect.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    /// The request this response answers.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    pub fn callback(&self) -> &CallbackRef {
        &self.request.callback
    }

    /// The body decoded as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Creates a request for `href`, resolved against this response's url.
    pub fn follow(&self, href: &str) -> Result<Request, SpiderError> {
        Ok(Request::new(self.url.join(href)?))
    }
}
