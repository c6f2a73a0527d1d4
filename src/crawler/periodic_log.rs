//! Periodic logging of crawl counters.
//!
//! When enabled, a background task logs one JSON object per interval with
//! up to three sections: `time` (configured and real interval, elapsed
//! time), `delta` (change of each counter since the previous log) and
//! `stats` (the counters themselves). One last object is logged when the
//! crawl shuts down.

use crate::stats::StatsSink;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, trace};

/// Substring filters over counter names.
///
/// With neither list set every name passes. Excludes take precedence; with
/// only excludes set every other name passes, otherwise a name must contain
/// one of the includes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NameFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl NameFilter {
    pub fn allows(&self, name: &str) -> bool {
        if self.include.is_empty() && self.exclude.is_empty() {
            return true;
        }
        if self.exclude.iter().any(|p| name.contains(p.as_str())) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|p| name.contains(p.as_str()))
    }
}

/// Which sections the periodic log carries and how often it is written.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PeriodicLogConfig {
    pub interval_secs: f64,
    /// Logs the counters themselves when set.
    pub stats: Option<NameFilter>,
    /// Logs per-interval changes when set.
    pub delta: Option<NameFilter>,
    pub timing: bool,
}

impl Default for PeriodicLogConfig {
    fn default() -> Self {
        PeriodicLogConfig {
            interval_secs: 60.0,
            stats: None,
            delta: None,
            timing: false,
        }
    }
}

impl PeriodicLogConfig {
    /// Whether any section is enabled.
    pub fn is_enabled(&self) -> bool {
        self.stats.is_some() || self.delta.is_some() || self.timing
    }
}

pub(crate) struct PeriodicLog {
    config: PeriodicLogConfig,
    stats: Arc<dyn StatsSink>,
    started: Instant,
    last_tick: Instant,
    last_counters: BTreeMap<String, usize>,
}

impl PeriodicLog {
    pub(crate) fn new(config: PeriodicLogConfig, stats: Arc<dyn StatsSink>) -> Self {
        let now = Instant::now();
        PeriodicLog {
            config,
            stats,
            started: now,
            last_tick: now,
            last_counters: BTreeMap::new(),
        }
    }

    /// Builds the next log entry and advances the delta and timing baselines.
    pub(crate) fn entry(&mut self) -> Value {
        let counters = self.stats.snapshot();
        let mut data = Map::new();

        if self.config.timing {
            let now = Instant::now();
            data.insert(
                "time".to_string(),
                json!({
                    "log_interval": self.config.interval_secs,
                    "log_interval_real": now.duration_since(self.last_tick).as_secs_f64(),
                    "elapsed": now.duration_since(self.started).as_secs_f64(),
                }),
            );
            self.last_tick = now;
        }

        if let Some(filter) = &self.config.delta {
            let current: BTreeMap<String, usize> = counters
                .iter()
                .filter(|(name, _)| filter.allows(name))
                .map(|(name, value)| (name.clone(), *value))
                .collect();
            let delta: Map<String, Value> = current
                .iter()
                .map(|(name, value)| {
                    let previous = self.last_counters.get(name).copied().unwrap_or(0);
                    let change = *value as i64 - previous as i64;
                    (name.clone(), Value::from(change))
                })
                .collect();
            data.insert("delta".to_string(), Value::Object(delta));
            self.last_counters = current;
        }

        if let Some(filter) = &self.config.stats {
            let stats: Map<String, Value> = counters
                .iter()
                .filter(|(name, _)| filter.allows(name))
                .map(|(name, value)| (name.clone(), Value::from(*value)))
                .collect();
            data.insert("stats".to_string(), Value::Object(stats));
        }

        Value::Object(data)
    }

    fn log(&mut self) {
        let entry = self.entry();
        match serde_json::to_string_pretty(&entry) {
            Ok(text) => info!("{}", text),
            Err(e) => info!("Periodic log could not be serialized: {}", e),
        }
    }
}

/// Spawns the logging task. The first entry is written right away, then one
/// per interval. Sending on (or dropping) the returned sender writes the
/// final entry and stops the task, which yields the number of entries
/// written.
pub(crate) fn spawn_periodic_log_task(
    config: PeriodicLogConfig,
    stats: Arc<dyn StatsSink>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<usize>) {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let period = Duration::from_secs_f64(config.interval_secs.max(0.001));

    let handle = tokio::spawn(async move {
        let mut periodic = PeriodicLog::new(config, stats);
        let mut timer = tokio::time::interval(period);
        let mut written = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    trace!("Writing final periodic log entry");
                    periodic.log();
                    written += 1;
                    break;
                }
                _ = timer.tick() => {
                    periodic.log();
                    written += 1;
                }
            }
        }
        written
    });
    (stop_tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatCollector;

    fn filter(include: &[&str], exclude: &[&str]) -> NameFilter {
        NameFilter {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn name_filters() {
        assert!(filter(&[], &[]).allows("downloader/request_count"));

        let only_exclude = filter(&[], &["spider_exceptions"]);
        assert!(only_exclude.allows("items_scraped"));
        assert!(!only_exclude.allows("spider_exceptions/binding"));

        let both = filter(&["downloader/"], &["exception"]);
        assert!(both.allows("downloader/request_count"));
        assert!(!both.allows("downloader/exception_count"));
        assert!(!both.allows("items_scraped"));
    }

    #[test]
    fn delta_tracks_changes_between_entries() {
        let stats = Arc::new(StatCollector::new());
        let config = PeriodicLogConfig {
            delta: Some(NameFilter::default()),
            stats: Some(filter(&["items"], &[])),
            ..Default::default()
        };
        let mut periodic = PeriodicLog::new(config, stats.clone());

        stats.increment("items_scraped", 3);
        stats.increment("requests_enqueued", 5);
        let first = periodic.entry();
        assert_eq!(first["delta"]["items_scraped"], 3);
        assert_eq!(first["stats"], json!({"items_scraped": 3}));
        assert!(first.get("time").is_none());

        stats.increment("items_scraped", 2);
        let second = periodic.entry();
        assert_eq!(second["delta"]["items_scraped"], 2);
        assert_eq!(second["delta"]["requests_enqueued"], 0);
    }

    #[tokio::test]
    async fn first_entry_is_written_at_start() {
        let config = PeriodicLogConfig {
            interval_secs: 3600.0,
            timing: true,
            ..Default::default()
        };
        let (stop_tx, handle) = spawn_periodic_log_task(config, Arc::new(StatCollector::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();
        // one entry at start, one on stop
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[test]
    fn timing_section_reports_intervals() {
        let stats = Arc::new(StatCollector::new());
        let config = PeriodicLogConfig {
            interval_secs: 5.0,
            timing: true,
            ..Default::default()
        };
        assert!(config.is_enabled());
        let entry = PeriodicLog::new(config, stats).entry();
        assert_eq!(entry["time"]["log_interval"], 5.0);
        assert!(entry["time"]["elapsed"].as_f64().unwrap() >= 0.0);
    }
}
