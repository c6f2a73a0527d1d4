//! # Spider Module
//!
//! Defines the `Spider` trait and the callback registry it exposes.
//!
//! ## Overview
//!
//! A spider supplies the lazy sequence of start requests and a set of named
//! callbacks. Each callback is registered together with its [`Signature`],
//! so binding a request's `cb_kwargs` is a pure lookup at dispatch time.
//! A callback receives the spider, the response and the bound arguments and
//! returns a lazy [`OutputStream`] of requests and items.
//!
//! ## Example
//!
//! ```rust,ignore
//! struct KwargsSpider;
//!
//! impl KwargsSpider {
//!     fn parse_first(self: Arc<Self>, response: Response, args: BoundArgs) -> OutputStream<'static> {
//!         let key: String = match args.get_as("key") {
//!             Ok(k) => k,
//!             Err(e) => return output::failed(e),
//!         };
//!         output::once(serde_json::json!({ "key": key, "url": response.url.as_str() }))
//!     }
//! }
//!
//! impl Spider for KwargsSpider {
//!     fn name(&self) -> &str { "kwargs" }
//!
//!     fn start_requests(&self) -> RequestStream<'static> {
//!         output::requests(vec![Request::get("http://localhost/first").unwrap()
//!             .with_callback("parse_first")
//!             .with_cb_kwargs(CbKwargs::new().with("key", "value"))])
//!     }
//!
//!     fn callbacks(&self) -> Callbacks<Self> {
//!         Callbacks::new().register(
//!             Signature::new("parse_first").required("key"),
//!             Self::parse_first,
//!         )
//!     }
//! }
//! ```

use crate::binding::Signature;
use crate::binding::BoundArgs;
use crate::output::{OutputStream, RequestStream};
use crate::response::Response;
use std::collections::HashMap;
use std::sync::Arc;

/// The function type behind a registered callback.
pub type Handler<S> =
    Arc<dyn Fn(Arc<S>, Response, BoundArgs) -> OutputStream<'static> + Send + Sync>;

/// A callback together with its declared parameters.
pub struct Callback<S> {
    pub signature: Signature,
    pub handler: Handler<S>,
}

impl<S> Clone for Callback<S> {
    fn clone(&self) -> Self {
        Callback {
            signature: self.signature.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// The callbacks a spider exposes, keyed by signature name.
pub struct Callbacks<S> {
    by_name: HashMap<String, Callback<S>>,
}

impl<S> Default for Callbacks<S> {
    fn default() -> Self {
        Callbacks {
            by_name: HashMap::new(),
        }
    }
}

impl<S> Callbacks<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under the signature's name, replacing any
    /// callback already registered with that name.
    pub fn register<F>(mut self, signature: Signature, handler: F) -> Self
    where
        F: Fn(Arc<S>, Response, BoundArgs) -> OutputStream<'static> + Send + Sync + 'static,
    {
        self.by_name.insert(
            signature.name().to_string(),
            Callback {
                signature,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Callback<S>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Defines the contract for a spider.
pub trait Spider: Send + Sync + Sized + 'static {
    fn name(&self) -> &str;

    /// The start requests, produced lazily.
    fn start_requests(&self) -> RequestStream<'static>;

    /// The callbacks requests may name. Called once when the crawler is built.
    fn callbacks(&self) -> Callbacks<Self>;
}
