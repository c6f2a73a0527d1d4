//! Contains the item processor functionality for the crawler.
//! This module hands scraped items to the configured item sinks concurrently.

use crate::output::Item;
use crate::sink::ItemSink;
use crate::state::CrawlerState;
use crate::stats::{counters, StatsSink};
use kanal::AsyncReceiver;
use log::{debug, error, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub(crate) fn spawn_item_processor_task(
    state: Arc<CrawlerState>,
    item_rx: AsyncReceiver<Item>,
    sinks: Arc<Vec<Box<dyn ItemSink>>>,
    max_concurrent_pipelines: usize,
    stats: Arc<dyn StatsSink>,
) -> tokio::task::JoinHandle<()> {
    let mut tasks = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(max_concurrent_pipelines));

    trace!(
        "Starting item processor with max_concurrent_pipelines: {}",
        max_concurrent_pipelines
    );
    tokio::spawn(async move {
        while let Ok(item) = item_rx.recv().await {
            trace!("Received item for processing");
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    warn!("Semaphore closed, shutting down item processor.");
                    break;
                }
            };

            let state_clone = Arc::clone(&state);
            let sinks_clone = Arc::clone(&sinks);
            let stats_clone = Arc::clone(&stats);

            tasks.spawn(async move {
                if run_sinks(item, &sinks_clone).await {
                    stats_clone.increment(counters::ITEMS_PROCESSED, 1);
                } else {
                    stats_clone.increment(counters::ITEMS_DROPPED, 1);
                }
                state_clone.processing_items.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });

            while let Some(res) = tasks.try_join_next() {
                if let Err(e) = res {
                    error!("An item processing task failed: {:?}", e);
                }
            }
        }

        trace!("Waiting for active item processing tasks to complete");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("An item processing task failed: {:?}", e);
            }
        }
        trace!("Item processor finished");
    })
}

// true when the item made it through every sink
async fn run_sinks(item: Item, sinks: &[Box<dyn ItemSink>]) -> bool {
    let mut current = item;
    for (idx, sink) in sinks.iter().enumerate() {
        trace!(
            "Processing item through sink '{}' ({} of {})",
            sink.name(),
            idx + 1,
            sinks.len()
        );
        match sink.process_item(current).await {
            Ok(Some(next)) => current = next,
            Ok(None) => {
                debug!("Sink '{}' dropped item", sink.name());
                return false;
            }
            Err(e) => {
                error!("Sink '{}' error: {}", sink.name(), e);
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpiderError;
    use crate::stats::StatCollector;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct DropOdd;

    #[async_trait]
    impl ItemSink for DropOdd {
        fn name(&self) -> &str {
            "drop-odd"
        }

        async fn process_item(&self, item: Item) -> Result<Option<Item>, SpiderError> {
            match item["n"].as_i64() {
                Some(n) if n % 2 == 1 => Ok(None),
                Some(_) => Ok(Some(item)),
                None => Err(SpiderError::GeneralError("item without n".into())),
            }
        }
    }

    #[derive(Default)]
    struct Collect(Arc<Mutex<Vec<Item>>>);

    #[async_trait]
    impl ItemSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn process_item(&self, item: Item) -> Result<Option<Item>, SpiderError> {
            self.0.lock().unwrap().push(item.clone());
            Ok(Some(item))
        }
    }

    #[tokio::test]
    async fn items_flow_through_sinks_in_order() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sinks: Vec<Box<dyn ItemSink>> =
            vec![Box::new(DropOdd), Box::new(Collect(collected.clone()))];
        let state = CrawlerState::new();
        let stats = Arc::new(StatCollector::new());
        let (item_tx, item_rx) = kanal::unbounded_async();

        let handle =
            spawn_item_processor_task(state.clone(), item_rx, Arc::new(sinks), 2, stats.clone());
        for item in [json!({"n": 1}), json!({"n": 2}), json!({"x": 0}), json!({"n": 4})] {
            state.processing_items.fetch_add(1, Ordering::SeqCst);
            item_tx.send(item).await.unwrap();
        }
        drop(item_tx);
        handle.await.unwrap();

        let mut seen: Vec<i64> = collected
            .lock()
            .unwrap()
            .iter()
            .filter_map(|i| i["n"].as_i64())
            .collect();
        seen.sort();
        assert_eq!(seen, vec![2, 4]);
        assert_eq!(stats.get_value(counters::ITEMS_PROCESSED), Some(2));
        assert_eq!(stats.get_value(counters::ITEMS_DROPPED), Some(2));
        assert_eq!(state.processing_items.load(Ordering::SeqCst), 0);
    }
}
