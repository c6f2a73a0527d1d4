//! # Request Module
//!
//! The request envelope carried through the pipeline.
//!
//! A `Request` holds its target url, the name of the callback that will
//! handle the eventual response, an opaque priority and the `cb_kwargs`
//! bag. The bag is owned by the request and is moved with it through every
//! stage, so middlewares mutate it through `&mut` access and never share it.

use crate::error::SpiderError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use url::Url;

/// Name of the callback used when a request does not set one.
pub const DEFAULT_CALLBACK: &str = "parse";

/// Identifies the spider callback that handles a request's response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackRef(String);

impl CallbackRef {
    pub fn new(name: impl Into<String>) -> Self {
        CallbackRef(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for CallbackRef {
    fn default() -> Self {
        CallbackRef::new(DEFAULT_CALLBACK)
    }
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallbackRef {
    fn from(name: &str) -> Self {
        CallbackRef::new(name)
    }
}

impl From<String> for CallbackRef {
    fn from(name: String) -> Self {
        CallbackRef(name)
    }
}

/// The keyword-argument bag attached to a request.
///
/// Equality ignores insertion order. Iteration follows insertion order, which
/// is what binding uses to decide which unexpected key gets reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CbKwargs(IndexMap<String, Value>);

impl CbKwargs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl IntoIterator for CbKwargs {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for CbKwargs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        CbKwargs(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A request travelling through the crawl pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: Url,
    pub callback: CallbackRef,
    pub cb_kwargs: CbKwargs,
    /// Opaque to the pipeline; carried for the scheduler.
    pub priority: i32,
}

impl Request {
    /// Creates a request for `url` handled by the default `parse` callback.
    pub fn new(url: Url) -> Self {
        Request {
            url,
            callback: CallbackRef::default(),
            cb_kwargs: CbKwargs::new(),
            priority: 0,
        }
    }

    /// Parses `url` and creates a request for it.
    pub fn get(url: &str) -> Result<Self, SpiderError> {
        Ok(Request::new(Url::parse(url)?))
    }

    pub fn with_callback(mut self, callback: impl Into<CallbackRef>) -> Self {
        self.callback = callback.into();
        self
    }

    pub fn with_cb_kwargs(mut self, cb_kwargs: CbKwargs) -> Self {
        self.cb_kwargs = cb_kwargs;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// The name of the callback this request is routed to.
    pub fn callback_name(&self) -> &str {
        self.callback.name()
    }
}
