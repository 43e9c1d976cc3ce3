//! The aggregation core: drains reader queues on a fixed interval and fans
//! representative samples out to the live feed and the CSV log.

pub mod csv;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Method};
use crate::feed::{FeedKey, FeedPoint, LiveFeed};
use crate::sensor::{AggregateSensor, Sample, SensorTable, Value};

use self::csv::CsvLog;

/// Mean buffered rows per sensor required before `ready` reports true when
/// logging is enabled.
const MIN_BUFFERED_ROWS: f64 = 2.0;

/// Options consumed by the aggregator, split out of [`Config`] so tests can
/// drive the tick loop without a full configuration.
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub interval: Duration,
    pub method: Method,
    pub log_directory: Option<PathBuf>,
    pub flush_interval: Duration,
}

impl From<&Config> for AggregatorOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            interval: cfg.interval,
            method: cfg.method,
            log_directory: cfg.logging.directory.clone(),
            flush_interval: cfg.logging.flush_interval,
        }
    }
}

/// Shared counters the run loop updates and the readiness probe reads.
#[derive(Debug, Default)]
struct TickState {
    ticks: AtomicU64,
    buffered_rows: AtomicU64,
    buffered_sensors: AtomicU64,
}

/// Timer-driven aggregation loop.
///
/// Single instance; owns the live feed write side and the CSV buffers once
/// started. Samples from any number of reader queues are bucketed by sensor
/// per tick, collapsed by the configured policy, and published.
pub struct Aggregator {
    options: AggregatorOptions,
    table: Arc<SensorTable>,
    feed: Arc<LiveFeed>,
    receivers: Option<Vec<UnboundedReceiver<Sample>>>,
    log: Option<CsvLog>,
    log_enabled: bool,
    state: Arc<TickState>,
    cancel: CancellationToken,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<()>>>>,
}

impl Aggregator {
    /// Creates an aggregator reading from `receivers`.
    ///
    /// The CSV log is only set up when a log directory is configured.
    pub fn new(
        options: AggregatorOptions,
        receivers: Vec<UnboundedReceiver<Sample>>,
        table: Arc<SensorTable>,
        feed: Arc<LiveFeed>,
    ) -> Result<Self> {
        let log = match &options.log_directory {
            Some(dir) => Some(CsvLog::new(dir.clone(), options.flush_interval)?),
            None => None,
        };

        Ok(Self {
            log_enabled: log.is_some(),
            options,
            table,
            feed,
            receivers: Some(receivers),
            log,
            state: Arc::new(TickState::default()),
            cancel: CancellationToken::new(),
            run_task: tokio::sync::Mutex::new(None),
        })
    }

    /// Spawns the tick loop.
    pub async fn start(&mut self) {
        let receivers = self.receivers.take().expect("start called more than once");
        let log = self.log.take();

        let options = self.options.clone();
        let table = Arc::clone(&self.table);
        let feed = Arc::clone(&self.feed);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            run(options, receivers, log, table, feed, state, cancel).await
        });

        *self.run_task.lock().await = Some(task);

        info!(
            interval = ?self.options.interval,
            method = ?self.options.method,
            logging = self.log_enabled,
            "aggregator started",
        );
    }

    /// Cancels the tick loop, waits for its final flush, and surfaces any
    /// logging I/O error. Idempotent; the aggregator cannot be restarted.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let task = { self.run_task.lock().await.take() };
        if let Some(task) = task {
            match task.await {
                Ok(result) => result?,
                Err(e) => warn!(error = %e, "aggregator task join failed"),
            }
        }

        Ok(())
    }

    /// Readiness probe: polls until the warm-up tick count has passed and,
    /// when logging, enough rows have accumulated per sensor to size a
    /// figure. Returns false if `timeout` elapses first.
    pub async fn ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.is_ready() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.options.interval).await;
        }
    }

    fn is_ready(&self) -> bool {
        if self.state.ticks.load(Ordering::Relaxed) <= ready_tick_threshold(self.options.interval)
        {
            return false;
        }

        if !self.log_enabled {
            return true;
        }

        let sensors = self.state.buffered_sensors.load(Ordering::Relaxed);
        if sensors == 0 {
            return false;
        }
        let rows = self.state.buffered_rows.load(Ordering::Relaxed);

        rows as f64 / sensors as f64 > MIN_BUFFERED_ROWS
    }
}

/// Warm-up ticks before readiness: roughly one second of ticks, never fewer
/// than five.
fn ready_tick_threshold(interval: Duration) -> u64 {
    let per_second = (1.0 / interval.as_secs_f64().max(f64::EPSILON)).ceil() as u64;
    per_second.max(5)
}

/// The tick loop body.
async fn run(
    options: AggregatorOptions,
    mut receivers: Vec<UnboundedReceiver<Sample>>,
    mut log: Option<CsvLog>,
    table: Arc<SensorTable>,
    feed: Arc<LiveFeed>,
    state: Arc<TickState>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Latest representative sample per sensor, feeding aggregate derivation.
    let mut latest: BTreeMap<String, Sample> = BTreeMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Drain whatever arrived since the last tick, then flush
                // everything buffered so no sample is lost on shutdown.
                let result = process_tick(
                    &options, &mut receivers, &mut log, &table, &feed, &state, &mut latest,
                )
                .and_then(|_| match log.as_mut() {
                    Some(log) => log.flush_all().context("final CSV flush"),
                    None => Ok(()),
                });

                if let Err(e) = &result {
                    error!(error = %e, "aggregator shutdown flush failed");
                }
                info!("aggregator stopped");
                return result;
            }

            _ = ticker.tick() => {
                if let Err(e) = process_tick(
                    &options, &mut receivers, &mut log, &table, &feed, &state, &mut latest,
                ) {
                    // Logging I/O failures must reach the process owner, not
                    // spin silently forever.
                    error!(error = %e, "aggregator tick failed");
                    return Err(e);
                }
            }
        }
    }
}

/// One read-aggregate-publish cycle.
fn process_tick(
    options: &AggregatorOptions,
    receivers: &mut [UnboundedReceiver<Sample>],
    log: &mut Option<CsvLog>,
    table: &SensorTable,
    feed: &LiveFeed,
    state: &TickState,
    latest: &mut BTreeMap<String, Sample>,
) -> Result<()> {
    let buckets = drain(receivers);

    for (sensor, bucket) in buckets {
        let representative = match options.method {
            Method::Last => bucket.last().expect("bucket is non-empty").clone(),
            Method::Average => average(&bucket),
        };

        publish(feed, table, &representative);

        match log.as_mut() {
            Some(log) => log.append(table, &representative),
            None => debug!(
                sensor = %representative.sensor,
                timestamp = representative.timestamp,
                values = ?representative.values,
                "representative sample",
            ),
        }

        latest.insert(sensor, representative);
    }

    for aggregate in table.aggregates() {
        let Some(derived) = derive(aggregate, latest) else {
            continue;
        };

        publish(feed, table, &derived);
        if let Some(log) = log.as_mut() {
            log.append(table, &derived);
        }
        latest.insert(derived.sensor.clone(), derived);
    }

    if let Some(log) = log.as_mut() {
        if log.maybe_flush().context("flushing CSV buffers")? {
            debug!("CSV buffers flushed");
        }

        let (rows, sensors) = log.buffered_counts();
        state.buffered_rows.store(rows as u64, Ordering::Relaxed);
        state
            .buffered_sensors
            .store(sensors as u64, Ordering::Relaxed);
    }

    state.ticks.fetch_add(1, Ordering::Relaxed);

    Ok(())
}

/// Non-blocking drain of every receiver into per-sensor buckets, preserving
/// per-reader arrival order.
fn drain(receivers: &mut [UnboundedReceiver<Sample>]) -> BTreeMap<String, Vec<Sample>> {
    let mut buckets: BTreeMap<String, Vec<Sample>> = BTreeMap::new();

    for receiver in receivers.iter_mut() {
        loop {
            match receiver.try_recv() {
                Ok(sample) => buckets
                    .entry(sample.sensor.clone())
                    .or_default()
                    .push(sample),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    buckets
}

/// Collapses a bucket to the final sample's timestamp and the per-field
/// arithmetic mean. Shapes are uniform per sensor by upstream casting.
fn average(bucket: &[Sample]) -> Sample {
    let last = bucket.last().expect("bucket is non-empty");

    let mut values = Vec::with_capacity(last.values.len());
    for i in 0..last.values.len() {
        let column: Vec<f64> = bucket
            .iter()
            .filter_map(|sample| sample.values.get(i))
            .map(Value::as_f64)
            .collect();
        values.push(Value::Float(column.iter().sum::<f64>() / column.len() as f64));
    }

    Sample {
        sensor: last.sensor.clone(),
        timestamp: last.timestamp,
        values,
    }
}

/// Derives one aggregate sample from the latest representative samples of
/// its constituents. Missing constituents are skipped; no constituents, no
/// sample.
fn derive(aggregate: &AggregateSensor, latest: &BTreeMap<String, Sample>) -> Option<Sample> {
    let constituents: Vec<&Sample> = aggregate
        .constituent_ids
        .iter()
        .filter_map(|id| latest.get(id))
        .collect();
    if constituents.is_empty() {
        return None;
    }

    let transform = aggregate.descriptor.transform()?;

    // Per-field streams zip across constituents; the time axis comes from
    // the first available one.
    let timestamp = constituents[0].timestamp;
    let width = constituents
        .iter()
        .map(|sample| sample.values.len())
        .min()
        .unwrap_or(0);
    if width == 0 {
        return None;
    }

    let mut values = Vec::with_capacity(width);
    for i in 0..width {
        let column: Vec<f64> = constituents
            .iter()
            .map(|sample| sample.values[i].as_f64())
            .collect();
        values.push(Value::Float(transform.apply(&column)?));
    }

    Some(Sample {
        sensor: aggregate.descriptor.name().to_string(),
        timestamp,
        values,
    })
}

/// Publishes a representative sample to the feed: one entry per plotted
/// value column when several are configured, else a single entry under the
/// sensor id.
fn publish(feed: &LiveFeed, table: &SensorTable, sample: &Sample) {
    let value_index = table
        .get(&sample.sensor)
        .map(|descriptor| descriptor.value_index().to_vec())
        .unwrap_or_default();

    if value_index.len() > 1 {
        for &index in &value_index {
            if let Some(value) = sample.values.get(index) {
                feed.publish(
                    FeedKey::value(sample.sensor.as_str(), index),
                    FeedPoint {
                        timestamp: sample.timestamp,
                        value: *value,
                    },
                );
            }
        }
        return;
    }

    let primary = value_index.first().copied().unwrap_or(0);
    if let Some(value) = sample.values.get(primary) {
        feed.publish(
            FeedKey::sensor(sample.sensor.as_str()),
            FeedPoint {
                timestamp: sample.timestamp,
                value: *value,
            },
        );
    }
}
