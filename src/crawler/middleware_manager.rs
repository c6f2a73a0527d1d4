//! Ordered middleware chains shared by the downloader and spider stages.
//!
//! A `MiddlewareChain` keeps its middlewares sorted by priority (ties keep
//! registration order) and runs one hook across them in either direction.
//! The chain is immutable once built and is shared behind an `Arc`, so
//! concurrent requests walk it without locking.

use crate::error::SpiderError;
use crate::middleware::{DownloaderMiddleware, MiddlewareAction, SpiderMiddleware};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use log::trace;

/// Which way a hook walks the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending priority: towards the wrapped action.
    Forward,
    /// Descending priority: back out from the wrapped action.
    Reverse,
}

struct Registered<M: ?Sized> {
    priority: i32,
    middleware: Box<M>,
}

/// One hook kind, applied to a single middleware.
#[async_trait]
pub trait Hook<M: ?Sized + Sync + 'static, T: Send + 'static>: Send + Sync {
    async fn call(&self, middleware: &M, item: T) -> Result<MiddlewareAction<T>, SpiderError>;
}

/// Middlewares of one kind ordered by priority.
pub struct MiddlewareChain<M: ?Sized> {
    entries: Vec<Registered<M>>,
}

impl<M: ?Sized> Default for MiddlewareChain<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<M: ?Sized + Sync + 'static> MiddlewareChain<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a middleware. Equal priorities run in registration order.
    pub fn register(&mut self, priority: i32, middleware: Box<M>) {
        let at = self
            .entries
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            at,
            Registered {
                priority,
                middleware,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The middlewares in the given direction.
    pub fn iter(&self, direction: Direction) -> Box<dyn Iterator<Item = &M> + Send + '_> {
        let entries = self.entries.iter().map(|e| &*e.middleware);
        match direction {
            Direction::Forward => Box::new(entries),
            Direction::Reverse => Box::new(entries.rev()),
        }
    }

    /// Runs `hook` over every middleware in `direction`, threading `item`
    /// through. Stops at the first hook that does not continue and returns
    /// its action; a hook error aborts the walk.
    pub async fn run<T, H>(
        &self,
        direction: Direction,
        item: T,
        hook: &H,
    ) -> Result<MiddlewareAction<T>, SpiderError>
    where
        T: Send + 'static,
        H: Hook<M, T>,
    {
        let mut current = item;
        for middleware in self.iter(direction) {
            match hook.call(middleware, current).await? {
                MiddlewareAction::Continue(next) => current = next,
                action => return Ok(action),
            }
        }
        Ok(MiddlewareAction::Continue(current))
    }

    /// Runs a response hook over every middleware in `direction`. Unlike
    /// [`run`](Self::run), `ReturnResponse` replaces the response and the walk
    /// goes on, so every middleware still sees it. `Drop` and `Retry` end the
    /// walk.
    pub async fn run_replacing<H>(
        &self,
        direction: Direction,
        response: Response,
        hook: &H,
    ) -> Result<MiddlewareAction<Response>, SpiderError>
    where
        H: Hook<M, Response>,
    {
        let mut current = response;
        for middleware in self.iter(direction) {
            match hook.call(middleware, current).await? {
                MiddlewareAction::Continue(next) => current = next,
                MiddlewareAction::ReturnResponse(replacement) => {
                    trace!("Response for {} replaced by a middleware", replacement.url);
                    current = replacement;
                }
                action => return Ok(action),
            }
        }
        Ok(MiddlewareAction::Continue(current))
    }
}

/// `DownloaderMiddleware::process_request`.
pub struct ProcessRequest;

#[async_trait]
impl Hook<dyn DownloaderMiddleware, Request> for ProcessRequest {
    async fn call(
        &self,
        middleware: &dyn DownloaderMiddleware,
        item: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        trace!("process_request via {} for {}", middleware.name(), item.url);
        middleware.process_request(item).await
    }
}

/// `DownloaderMiddleware::process_response`.
pub struct ProcessResponse;

#[async_trait]
impl Hook<dyn DownloaderMiddleware, Response> for ProcessResponse {
    async fn call(
        &self,
        middleware: &dyn DownloaderMiddleware,
        item: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        trace!("process_response via {} for {}", middleware.name(), item.url);
        middleware.process_response(item).await
    }
}

/// `DownloaderMiddleware::process_exception`, carrying the failure reason.
pub struct ProcessException {
    pub reason: String,
}

#[async_trait]
impl Hook<dyn DownloaderMiddleware, Request> for ProcessException {
    async fn call(
        &self,
        middleware: &dyn DownloaderMiddleware,
        item: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        trace!("process_exception via {} for {}", middleware.name(), item.url);
        middleware.process_exception(item, &self.reason).await
    }
}

/// `SpiderMiddleware::process_spider_input`.
pub struct ProcessSpiderInput;

#[async_trait]
impl Hook<dyn SpiderMiddleware, Response> for ProcessSpiderInput {
    async fn call(
        &self,
        middleware: &dyn SpiderMiddleware,
        item: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        trace!("process_spider_input via {} for {}", middleware.name(), item.url);
        middleware.process_spider_input(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    impl Recorder {
        fn boxed(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn DownloaderMiddleware> {
            Box::new(Recorder {
                name: name.to_string(),
                log: Arc::clone(log),
                short_circuit: false,
            })
        }
    }

    #[async_trait]
    impl DownloaderMiddleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process_request(
            &self,
            mut request: Request,
        ) -> Result<MiddlewareAction<Request>, SpiderError> {
            self.log.lock().unwrap().push(format!("pre:{}", self.name));
            request.cb_kwargs.insert(format!("seen_by_{}", self.name), true);
            if self.short_circuit {
                return Ok(MiddlewareAction::ReturnResponse(Response::new(request, 200, "cached")));
            }
            Ok(MiddlewareAction::Continue(request))
        }

        async fn process_response(
            &self,
            response: Response,
        ) -> Result<MiddlewareAction<Response>, SpiderError> {
            self.log.lock().unwrap().push(format!("post:{}", self.name));
            Ok(MiddlewareAction::Continue(response))
        }
    }

    fn request() -> Request {
        Request::get("http://localhost/chain").unwrap()
    }

    #[tokio::test]
    async fn priorities_order_forward_and_reverse_walks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain: MiddlewareChain<dyn DownloaderMiddleware> = MiddlewareChain::new();
        chain.register(750, Recorder::boxed("c", &log));
        chain.register(100, Recorder::boxed("a", &log));
        chain.register(500, Recorder::boxed("b", &log));
        chain.register(500, Recorder::boxed("b2", &log));

        let action = chain.run(Direction::Forward, request(), &ProcessRequest).await.unwrap();
        let request = match action {
            MiddlewareAction::Continue(r) => r,
            other => panic!("unexpected action {:?}", other),
        };
        assert_eq!(request.cb_kwargs.len(), 4);

        let response = Response::new(request, 200, "");
        chain.run(Direction::Reverse, response, &ProcessResponse).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "pre:a", "pre:b", "pre:b2", "pre:c", "post:c", "post:b2", "post:b", "post:a"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_remaining_pre_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain: MiddlewareChain<dyn DownloaderMiddleware> = MiddlewareChain::new();
        chain.register(1, Recorder::boxed("first", &log));
        chain.register(
            2,
            Box::new(Recorder {
                name: "cache".into(),
                log: Arc::clone(&log),
                short_circuit: true,
            }),
        );
        chain.register(3, Recorder::boxed("never", &log));

        let action = chain.run(Direction::Forward, request(), &ProcessRequest).await.unwrap();
        match action {
            MiddlewareAction::ReturnResponse(response) => {
                assert_eq!(response.body.as_ref(), b"cached");
                assert!(response.request().cb_kwargs.contains_key("seen_by_first"));
            }
            other => panic!("expected a short-circuit, got {:?}", other),
        }
        assert_eq!(*log.lock().unwrap(), vec!["pre:first", "pre:cache"]);
    }

    struct Failing;

    #[async_trait]
    impl DownloaderMiddleware for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process_request(
            &self,
            _request: Request,
        ) -> Result<MiddlewareAction<Request>, SpiderError> {
            Err(SpiderError::middleware("failing", "refused"))
        }
    }

    #[tokio::test]
    async fn hook_errors_propagate_to_the_caller() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain: MiddlewareChain<dyn DownloaderMiddleware> = MiddlewareChain::new();
        chain.register(0, Box::new(Failing));
        chain.register(1, Recorder::boxed("after", &log));

        let result = chain.run(Direction::Forward, request(), &ProcessRequest).await;
        assert!(matches!(result, Err(SpiderError::Middleware { .. })));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_chain_continues() {
        let chain: MiddlewareChain<dyn DownloaderMiddleware> = MiddlewareChain::new();
        assert!(chain.is_empty());
        let action = chain.run(Direction::Reverse, request(), &ProcessRequest).await.unwrap();
        assert!(action.is_continue());
    }
}
