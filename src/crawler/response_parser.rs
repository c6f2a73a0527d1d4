//! # Response Parser Module
//!
//! Contains the spider stage: everything that happens to a response after
//! the downloader stage is done with it.
//!
//! ## Overview
//!
//! For each response the stage
//!
//! 1. runs the spider middleware input hooks in ascending priority order,
//! 2. resolves the callback named by the originating request and binds the
//!    request's `cb_kwargs` against its signature,
//! 3. invokes the callback to get a lazy output stream,
//! 4. wraps that stream with the output hooks, nearest-the-spider first,
//! 5. pulls the stream, re-submitting requests and forwarding items.
//!
//! Binding failures and callback errors are recorded through the log sink
//! and end the processing of that response only. Errors raised by output
//! hooks follow the configured [`OutputErrorPolicy`].

use crate::builder::OutputErrorPolicy;
use crate::crawler::middleware_manager::{Direction, MiddlewareChain, ProcessSpiderInput};
use crate::crawler::request_handler::RequestQueue;
use crate::error::SpiderError;
use crate::middleware::{MiddlewareAction, SpiderMiddleware};
use crate::output::{self, Item, Output, OutputStream};
use crate::response::Response;
use crate::sink::{FailureRecord, LogSink};
use crate::spider::{Callbacks, Spider};
use crate::state::CrawlerState;
use crate::stats::{counters, StatsSink};

use futures_util::StreamExt;
use kanal::AsyncSender;
use log::{debug, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub(crate) type FatalSlot = Arc<Mutex<Option<SpiderError>>>;

/// Where dispatch results go: requests back into the pipeline, items to the
/// item sinks, and a slot for the error that stops the crawl.
#[derive(Clone)]
pub(crate) struct Outlets {
    pub(crate) requests: RequestQueue,
    item_tx: AsyncSender<Item>,
    state: Arc<CrawlerState>,
    stats: Arc<dyn StatsSink>,
    fatal: FatalSlot,
}

impl Outlets {
    pub(crate) fn new(
        requests: RequestQueue,
        item_tx: AsyncSender<Item>,
        state: Arc<CrawlerState>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            requests,
            item_tx,
            state,
            stats,
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    async fn send_item(&self, item: Item) -> Result<(), SpiderError> {
        self.state.processing_items.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.item_tx.send(item).await {
            self.state.processing_items.fetch_sub(1, Ordering::SeqCst);
            return Err(SpiderError::GeneralError(format!(
                "item channel closed: {}",
                e
            )));
        }
        self.stats.increment(counters::ITEMS_SCRAPED, 1);
        Ok(())
    }

    /// Stops the crawl. Only the error that started the shutdown is kept.
    pub(crate) fn abort(&self, error: SpiderError) {
        if self.state.aborted.swap(true, Ordering::SeqCst) {
            debug!("Crawl already stopping, not recording: {}", error);
            return;
        }
        if let Ok(mut slot) = self.fatal.lock() {
            *slot = Some(error);
        }
    }

    pub(crate) fn fatal_slot(&self) -> FatalSlot {
        Arc::clone(&self.fatal)
    }
}

/// Dispatches responses to spider callbacks through the spider middlewares.
pub struct SpiderStage<S: Spider> {
    spider: Arc<S>,
    callbacks: Callbacks<S>,
    middlewares: Arc<MiddlewareChain<dyn SpiderMiddleware>>,
    stats: Arc<dyn StatsSink>,
    log_sink: Arc<dyn LogSink>,
    policy: OutputErrorPolicy,
}

impl<S: Spider> SpiderStage<S> {
    pub fn new(
        spider: Arc<S>,
        middlewares: Arc<MiddlewareChain<dyn SpiderMiddleware>>,
        stats: Arc<dyn StatsSink>,
        log_sink: Arc<dyn LogSink>,
        policy: OutputErrorPolicy,
    ) -> Self {
        let callbacks = spider.callbacks();
        Self {
            spider,
            callbacks,
            middlewares,
            stats,
            log_sink,
            policy,
        }
    }

    /// Resolves the callback for `response`, binds its `cb_kwargs` and
    /// invokes it. No middleware runs here.
    pub fn dispatch(&self, response: Response) -> Result<OutputStream<'static>, SpiderError> {
        let name = response.callback().name().to_string();
        let callback = self
            .callbacks
            .get(&name)
            .ok_or_else(|| SpiderError::UnknownCallback(name.clone()))?;
        let args = callback
            .signature
            .bind(response.request().cb_kwargs.clone())?;
        trace!("Dispatching {} to {}()", response.url, name);

        let raw = (callback.handler)(Arc::clone(&self.spider), response, args);
        Ok(raw
            .map(move |result| {
                result.map_err(|e| match e {
                    e @ SpiderError::Callback { .. } => e,
                    other => SpiderError::callback(name.as_str(), other),
                })
            })
            .boxed())
    }

    /// Runs the input hooks, the callback and the output hooks. The returned
    /// stream is lazy; output hooks see each element as it is pulled.
    ///
    /// Failures that only concern this response are recorded and yield an
    /// empty stream.
    pub async fn process(&self, response: Response) -> OutputStream<'_> {
        let url = response.url.to_string();
        let callback = response.callback().name().to_string();

        let response = match self
            .middlewares
            .run_replacing(Direction::Forward, response, &ProcessSpiderInput)
            .await
        {
            Ok(MiddlewareAction::Continue(response))
            | Ok(MiddlewareAction::ReturnResponse(response)) => response,
            Ok(MiddlewareAction::Drop) => {
                debug!("Response dropped by spider middleware: {}", url);
                self.stats.increment(counters::REQUESTS_DROPPED, 1);
                return output::empty();
            }
            Ok(MiddlewareAction::Retry(request, delay)) => {
                debug!("Spider middleware re-submits {} after {:?}", request.url, delay);
                self.stats.increment(counters::REQUESTS_RETRIED, 1);
                return output::delayed(*request, delay);
            }
            Err(e) => {
                self.stats
                    .increment(counters::SPIDER_EXCEPTIONS_MIDDLEWARE, 1);
                self.record(callback, url, e);
                return output::empty();
            }
        };

        let seen = response.clone();
        let raw = match self.dispatch(response) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.increment(counters::SPIDER_EXCEPTIONS_BINDING, 1);
                self.record(callback, url, e);
                return output::empty();
            }
        };
        self.stats.increment(counters::RESPONSES_DISPATCHED, 1);

        let mut stream: OutputStream<'_> = raw;
        for middleware in self.middlewares.iter(Direction::Reverse) {
            trace!("process_spider_output via {} for {}", middleware.name(), url);
            stream = middleware.process_spider_output(&seen, stream);
        }
        stream
    }

    /// Processes `response` and delivers every output element. Returns an
    /// error only when the crawl must stop.
    pub(crate) async fn process_and_deliver(
        &self,
        response: Response,
        outlets: &Outlets,
    ) -> Result<(), SpiderError> {
        let url = response.url.to_string();
        let callback = response.callback().name().to_string();
        let mut stream = self.process(response).await;

        while let Some(next) = stream.next().await {
            match next {
                Ok(Output::Request(request)) => outlets.requests.submit(request).await?,
                Ok(Output::Item(item)) => outlets.send_item(item).await?,
                Err(e @ SpiderError::Callback { .. }) => {
                    self.stats.increment(counters::SPIDER_EXCEPTIONS_CALLBACK, 1);
                    self.record(callback, url, e);
                    break;
                }
                Err(e) => {
                    self.stats
                        .increment(counters::SPIDER_EXCEPTIONS_MIDDLEWARE, 1);
                    match self.policy {
                        OutputErrorPolicy::AbortResponse => {
                            warn!("Discarding remaining output of {}", url);
                            self.record(callback, url, e);
                            break;
                        }
                        OutputErrorPolicy::AbortCrawl => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    fn record(&self, callback: String, url: String, error: SpiderError) {
        self.log_sink.record(FailureRecord {
            callback,
            url,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BoundArgs, Signature};
    use crate::error::BindingError;
    use crate::output::RequestStream;
    use crate::request::{CbKwargs, Request};
    use crate::stats::StatCollector;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::{Duration, Instant};

    struct Echo;

    impl Echo {
        fn parse_pair(self: Arc<Self>, _response: Response, args: BoundArgs) -> OutputStream<'static> {
            let named = args.named().map(|(k, v)| (k.to_string(), v.clone()));
            output::once(Value::Object(named.collect()))
        }

        fn parse_follow(self: Arc<Self>, response: Response, _args: BoundArgs) -> OutputStream<'static> {
            let output = async_stream::try_stream! {
                let next = response.follow("/next")?.with_callback("parse_pair");
                yield Output::Request(next);
                Err::<(), _>(SpiderError::GeneralError("page layout changed".into()))?;
                yield Output::Item(json!({"never": true}));
            };
            output.boxed()
        }
    }

    impl Spider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn start_requests(&self) -> RequestStream<'static> {
            output::requests(Vec::new())
        }

        fn callbacks(&self) -> Callbacks<Self> {
            Callbacks::new()
                .register(
                    Signature::new("parse_pair").required("key").optional("number", Value::Null),
                    Self::parse_pair,
                )
                .register(Signature::new("parse_follow"), Self::parse_follow)
        }
    }

    #[derive(Default)]
    struct CollectingLog(Mutex<Vec<String>>);

    impl LogSink for CollectingLog {
        fn record(&self, failure: FailureRecord) {
            let line = format!("{}: {}", failure.kind(), failure.error);
            self.0.lock().unwrap().push(line);
        }
    }

    struct MarkInput;

    #[async_trait]
    impl SpiderMiddleware for MarkInput {
        fn name(&self) -> &str {
            "mark-input"
        }

        async fn process_spider_input(
            &self,
            mut response: Response,
        ) -> Result<MiddlewareAction<Response>, SpiderError> {
            response.request_mut().cb_kwargs.insert("number", 7);
            Ok(MiddlewareAction::Continue(response))
        }
    }

    struct FailingOutput;

    #[async_trait]
    impl SpiderMiddleware for FailingOutput {
        fn name(&self) -> &str {
            "failing-output"
        }

        fn process_spider_output<'a>(
            &'a self,
            _response: &Response,
            output: OutputStream<'a>,
        ) -> OutputStream<'a> {
            let failing = async_stream::stream! {
                let mut output = output;
                if let Some(first) = output.next().await {
                    yield first;
                }
                yield Err(SpiderError::middleware("failing-output", "broken hook"));
            };
            failing.boxed()
        }
    }

    enum Verdict {
        Drop,
        Retry,
        Replace,
        Fail,
    }

    /// Acts on responses for `/page` and lets every other response through.
    struct InputVerdict(Verdict);

    #[async_trait]
    impl SpiderMiddleware for InputVerdict {
        fn name(&self) -> &str {
            "input-verdict"
        }

        async fn process_spider_input(
            &self,
            response: Response,
        ) -> Result<MiddlewareAction<Response>, SpiderError> {
            if response.url.path() != "/page" {
                return Ok(MiddlewareAction::Continue(response));
            }
            let request = response.request().clone();
            match self.0 {
                Verdict::Drop => Ok(MiddlewareAction::Drop),
                Verdict::Retry => Ok(MiddlewareAction::Retry(
                    Box::new(request),
                    Duration::from_millis(30),
                )),
                Verdict::Replace => Ok(MiddlewareAction::ReturnResponse(Response::new(
                    request,
                    203,
                    "substituted",
                ))),
                Verdict::Fail => Err(SpiderError::middleware("input-verdict", "rejected")),
            }
        }
    }

    fn with_verdict(verdict: Verdict) -> MiddlewareChain<dyn SpiderMiddleware> {
        let mut chain: MiddlewareChain<dyn SpiderMiddleware> = MiddlewareChain::new();
        chain.register(100, Box::new(InputVerdict(verdict)));
        chain
    }

    fn stage(
        chain: MiddlewareChain<dyn SpiderMiddleware>,
        policy: OutputErrorPolicy,
    ) -> (SpiderStage<Echo>, Arc<StatCollector>, Arc<CollectingLog>) {
        let stats = Arc::new(StatCollector::new());
        let log = Arc::new(CollectingLog::default());
        let stage = SpiderStage::new(Arc::new(Echo), Arc::new(chain), stats.clone(), log.clone(), policy);
        (stage, stats, log)
    }

    fn outlets() -> (Outlets, kanal::AsyncReceiver<Request>, kanal::AsyncReceiver<Item>) {
        let (req_tx, req_rx) = kanal::unbounded_async();
        let (item_tx, item_rx) = kanal::unbounded_async();
        let state = CrawlerState::new();
        let stats: Arc<dyn StatsSink> = Arc::new(StatCollector::new());
        let queue = RequestQueue::new(req_tx, state.clone(), stats.clone());
        (Outlets::new(queue, item_tx, state, stats), req_rx, item_rx)
    }

    fn response_for(callback: &str, kwargs: CbKwargs) -> Response {
        response_at("/page", callback, kwargs)
    }

    fn response_at(path: &str, callback: &str, kwargs: CbKwargs) -> Response {
        let request = Request::get(&format!("http://localhost{}", path))
            .unwrap()
            .with_callback(callback)
            .with_cb_kwargs(kwargs);
        Response::new(request, 200, "")
    }

    #[tokio::test]
    async fn input_hook_mutations_reach_the_callback() {
        let mut chain: MiddlewareChain<dyn SpiderMiddleware> = MiddlewareChain::new();
        chain.register(750, Box::new(MarkInput));
        let (stage, stats, _) = stage(chain, OutputErrorPolicy::AbortResponse);

        let items: Vec<_> = stage
            .process(response_for("parse_pair", CbKwargs::new().with("key", "value")))
            .await
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            Ok(Output::Item(item)) => assert_eq!(item, &json!({"key": "value", "number": 7})),
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(stats.get_value(counters::RESPONSES_DISPATCHED), Some(1));
    }

    #[tokio::test]
    async fn dispatch_reports_binding_errors() {
        let (stage, _, _) = stage(MiddlewareChain::new(), OutputErrorPolicy::AbortResponse);
        let bag = CbKwargs::new().with("key", "a").with("extra", 1);
        match stage.dispatch(response_for("parse_pair", bag)) {
            Err(SpiderError::Binding(BindingError::UnexpectedArgument { key, .. })) => {
                assert_eq!(key, "extra")
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("binding should fail"),
        }
        match stage.dispatch(response_for("parse_missing", CbKwargs::new())) {
            Err(SpiderError::UnknownCallback(name)) => assert_eq!(name, "parse_missing"),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("dispatch should fail"),
        }
    }

    #[tokio::test]
    async fn binding_failures_are_logged_and_skip_the_response() {
        let (stage, stats, log) = stage(MiddlewareChain::new(), OutputErrorPolicy::AbortResponse);
        let outputs: Vec<_> = stage
            .process(response_for("parse_pair", CbKwargs::new()))
            .await
            .collect()
            .await;
        assert!(outputs.is_empty());
        assert_eq!(stats.get_value(counters::SPIDER_EXCEPTIONS_BINDING), Some(1));
        let lines = log.0.lock().unwrap();
        assert_eq!(
            lines.as_slice(),
            ["MissingArgumentError: parse_pair() missing 1 required positional argument: 'key'"]
        );
    }

    #[tokio::test]
    async fn callback_errors_stop_only_that_response() {
        let (stage, stats, log) = stage(MiddlewareChain::new(), OutputErrorPolicy::AbortCrawl);
        let (outlets, req_rx, item_rx) = outlets();

        let result = stage
            .process_and_deliver(response_for("parse_follow", CbKwargs::new()), &outlets)
            .await;
        assert!(result.is_ok());

        let next = req_rx.try_recv().unwrap().unwrap();
        assert_eq!(next.url.as_str(), "http://localhost/next");
        assert!(item_rx.try_recv().unwrap().is_none());
        assert_eq!(stats.get_value(counters::SPIDER_EXCEPTIONS_CALLBACK), Some(1));
        assert!(log.0.lock().unwrap()[0].starts_with("CallbackError"));
    }

    #[tokio::test]
    async fn output_hook_errors_follow_the_policy() {
        for policy in [OutputErrorPolicy::AbortResponse, OutputErrorPolicy::AbortCrawl] {
            let mut chain: MiddlewareChain<dyn SpiderMiddleware> = MiddlewareChain::new();
            chain.register(500, Box::new(FailingOutput));
            let (stage, _, log) = stage(chain, policy);
            let (outlets, _req_rx, item_rx) = outlets();

            let bag = CbKwargs::new().with("key", "value");
            let result = stage
                .process_and_deliver(response_for("parse_pair", bag), &outlets)
                .await;
            // the element pulled before the failure is still delivered
            assert!(item_rx.try_recv().unwrap().is_some());
            match policy {
                OutputErrorPolicy::AbortResponse => {
                    assert!(result.is_ok());
                    assert_eq!(log.0.lock().unwrap().len(), 1);
                }
                OutputErrorPolicy::AbortCrawl => {
                    assert!(matches!(result, Err(SpiderError::Middleware { .. })));
                }
            }
        }
    }

    #[tokio::test]
    async fn replaced_input_still_reaches_later_input_hooks() {
        let mut chain = with_verdict(Verdict::Replace);
        chain.register(750, Box::new(MarkInput));
        let (stage, _, _) = stage(chain, OutputErrorPolicy::AbortResponse);

        let items: Vec<_> = stage
            .process(response_for("parse_pair", CbKwargs::new().with("key", "value")))
            .await
            .collect()
            .await;
        match items.as_slice() {
            [Ok(Output::Item(item))] => assert_eq!(item, &json!({"key": "value", "number": 7})),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropped_input_is_not_dispatched() {
        let (stage, stats, log) = stage(with_verdict(Verdict::Drop), OutputErrorPolicy::AbortResponse);
        let outputs: Vec<_> = stage
            .process(response_for("parse_pair", CbKwargs::new().with("key", "value")))
            .await
            .collect()
            .await;
        assert!(outputs.is_empty());
        assert_eq!(stats.get_value(counters::REQUESTS_DROPPED), Some(1));
        assert_eq!(stats.get_value(counters::RESPONSES_DISPATCHED), None);
        assert!(log.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retried_input_re_emits_the_request_after_its_delay() {
        let (stage, stats, _) = stage(with_verdict(Verdict::Retry), OutputErrorPolicy::AbortResponse);
        let started = Instant::now();
        let outputs: Vec<_> = stage
            .process(response_for("parse_pair", CbKwargs::new().with("key", "value")))
            .await
            .collect()
            .await;
        assert!(started.elapsed() >= Duration::from_millis(30));
        match outputs.as_slice() {
            [Ok(Output::Request(request))] => {
                assert_eq!(request.url.path(), "/page");
                assert_eq!(request.callback_name(), "parse_pair");
            }
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(stats.get_value(counters::REQUESTS_RETRIED), Some(1));
        assert_eq!(stats.get_value(counters::RESPONSES_DISPATCHED), None);
    }

    #[tokio::test]
    async fn failing_input_hook_skips_only_that_response() {
        let (stage, stats, log) = stage(with_verdict(Verdict::Fail), OutputErrorPolicy::AbortCrawl);
        let (outlets, _req_rx, item_rx) = outlets();

        let bag = CbKwargs::new().with("key", "value");
        let failed = stage
            .process_and_deliver(response_for("parse_pair", bag.clone()), &outlets)
            .await;
        assert!(failed.is_ok());
        assert!(item_rx.try_recv().unwrap().is_none());
        assert_eq!(stats.get_value(counters::SPIDER_EXCEPTIONS_MIDDLEWARE), Some(1));
        assert!(log.0.lock().unwrap()[0].starts_with("MiddlewareHookError"));

        // the next response goes through as usual
        stage
            .process_and_deliver(response_at("/other", "parse_pair", bag), &outlets)
            .await
            .unwrap();
        assert!(item_rx.try_recv().unwrap().is_some());
        assert_eq!(stats.get_value(counters::RESPONSES_DISPATCHED), Some(1));
    }
}
