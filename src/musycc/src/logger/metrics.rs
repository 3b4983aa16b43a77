// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process wide counters, flushed as one JSON object per line.
//!
//! ```json
//! {
//!  "logger": { "missed_log_count": 0, "missed_metrics_count": 0 },
//!  "musycc_card0": { "interrupts": 12, "iq_entries": 40, ... },
//!  "musycc": { "interrupts": 12, ... }
//! }
//! ```
//!
//! Every card contributes a `musycc_<card>` object and the `musycc` object sums them. Counters
//! report what happened since the previous flush: a [`SharedIncMetric`] keeps the value it last
//! serialized next to the running count, so the counting threads never wait on a flush.

use std::fmt;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::{Serialize, Serializer};

use super::extract_guard;
use crate::devices::musycc::metrics as card_metrics;

/// Counters of the process.
pub static METRICS: Metrics = Metrics::new();

/// Errors of the metrics sink.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// The metrics sink is already set
    AlreadyInitialized,
    /// Cannot serialize the metrics: {0}
    Serde(String),
    /// Cannot write the metrics: {0}
    Write(std::io::Error),
}

/// Counters plus the place they are flushed to.
pub struct Metrics {
    sink: OnceLock<Mutex<Box<dyn Write + Send>>>,
    counters: DriverMetrics,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("sink_set", &self.sink.get().is_some())
            .field("counters", &self.counters)
            .finish()
    }
}

impl Metrics {
    /// Counters without a sink.
    pub const fn new() -> Self {
        Metrics {
            sink: OnceLock::new(),
            counters: DriverMetrics::new(),
        }
    }

    /// Sets where [`Metrics::write`] goes. Only the first call succeeds.
    pub fn init(&self, sink: impl Write + Send + 'static) -> Result<(), MetricsError> {
        self.sink
            .set(Mutex::new(Box::new(sink)))
            .map_err(|_| MetricsError::AlreadyInitialized)
    }

    /// Serializes the counters as one line to the sink.
    ///
    /// Returns `Ok(false)` without touching the counters while no sink is set.
    pub fn write(&self) -> Result<bool, MetricsError> {
        let Some(sink) = self.sink.get() else {
            return Ok(false);
        };
        let mut line = serde_json::to_vec(&self.counters).map_err(|err| {
            self.counters.logger.missed_metrics_count.inc();
            MetricsError::Serde(err.to_string())
        })?;
        line.push(b'\n');
        extract_guard(sink.lock())
            .write_all(&line)
            .map_err(|err| {
                self.counters.logger.missed_metrics_count.inc();
                MetricsError::Write(err)
            })?;
        Ok(true)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Metrics {
    type Target = DriverMetrics;

    fn deref(&self) -> &DriverMetrics {
        &self.counters
    }
}

/// A monotonically increasing counter.
pub trait IncMetric {
    /// Adds `value`.
    fn add(&self, value: u64);
    /// Adds one.
    fn inc(&self) {
        self.add(1);
    }
    /// Total since creation.
    fn count(&self) -> u64;
    /// Amount added since the last flush.
    fn fetch_diff(&self) -> u64;
}

/// Counter shared by the interrupt, bottom half and worker threads and the callers.
#[derive(Debug, Default)]
pub struct SharedIncMetric {
    count: AtomicU64,
    flushed: AtomicU64,
}

impl SharedIncMetric {
    /// Zeroed counter.
    pub const fn new() -> Self {
        SharedIncMetric {
            count: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn fetch_diff(&self) -> u64 {
        self.count()
            .saturating_sub(self.flushed.load(Ordering::Relaxed))
    }
}

impl Serialize for SharedIncMetric {
    /// Serializes the amount added since the last flush, and counts this as a flush.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let now = self.count();
        let ok = serializer.serialize_u64(now.saturating_sub(self.flushed.load(Ordering::Relaxed)))?;
        self.flushed.store(now, Ordering::Relaxed);
        Ok(ok)
    }
}

/// Counters of the logger and of the metrics sink.
#[derive(Debug, Default, Serialize)]
pub struct LoggerSystemMetrics {
    /// Log lines that could not be written.
    pub missed_log_count: SharedIncMetric,
    /// Metrics flushes that failed.
    pub missed_metrics_count: SharedIncMetric,
}

impl LoggerSystemMetrics {
    /// Zeroed counters.
    pub const fn new() -> Self {
        LoggerSystemMetrics {
            missed_log_count: SharedIncMetric::new(),
            missed_metrics_count: SharedIncMetric::new(),
        }
    }
}

/// Places the per card objects next to `logger` in the flushed object.
#[derive(Debug, Default)]
pub struct CardMetricsSerializeProxy;

impl Serialize for CardMetricsSerializeProxy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        card_metrics::flush_metrics(serializer)
    }
}

/// Everything the process counts.
#[derive(Debug, Default, Serialize)]
pub struct DriverMetrics {
    /// Logger counters.
    pub logger: LoggerSystemMetrics,
    /// Per card counters.
    #[serde(flatten)]
    pub cards: CardMetricsSerializeProxy,
}

impl DriverMetrics {
    /// Zeroed counters.
    pub const fn new() -> Self {
        DriverMetrics {
            logger: LoggerSystemMetrics::new(),
            cards: CardMetricsSerializeProxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[derive(Clone, Debug, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_needs_sink() {
        let metrics = Metrics::new();
        metrics.logger.missed_log_count.add(3);
        assert!(!metrics.write().unwrap());

        let capture = Capture::default();
        metrics.init(capture.clone()).unwrap();
        assert!(matches!(
            metrics.init(Capture::default()),
            Err(MetricsError::AlreadyInitialized)
        ));

        assert!(metrics.write().unwrap());
        assert!(metrics.write().unwrap());
        let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["logger"]["missed_log_count"], 3);
        assert_eq!(lines[1]["logger"]["missed_log_count"], 0);
        assert!(lines[0]["musycc"].is_object());
    }

    #[test]
    fn test_concurrent_increments() {
        let metric = Arc::new(SharedIncMetric::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let metric = metric.clone();
                thread::spawn(move || (0..10_000).for_each(|_| metric.inc()))
            })
            .collect();
        workers
            .into_iter()
            .for_each(|worker| worker.join().unwrap());
        assert_eq!(metric.count(), 40_000);
        assert_eq!(metric.fetch_diff(), 40_000);
    }

    #[test]
    fn test_serialize_is_a_flush() {
        let metric = SharedIncMetric::new();
        metric.add(5);
        assert_eq!(serde_json::to_string(&metric).unwrap(), "5");
        assert_eq!(metric.fetch_diff(), 0);
        metric.inc();
        assert_eq!(serde_json::to_string(&metric).unwrap(), "1");
        assert_eq!(metric.count(), 6);
    }
}
