// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system of the MUSYCC engine.
//!
//! # Metrics format
//! The metrics are flushed in JSON when requested by `musycc::logger::METRICS.write()`.
//!
//! ## JSON example with metrics:
//! ```json
//! {
//!  "musycc_card0": {
//!     "interrupts": "SharedIncMetric",
//!     "spurious_interrupts": "SharedIncMetric",
//!     "iq_entries": "SharedIncMetric",
//!     ...
//!  }
//!  "musycc": {
//!     "interrupts": "SharedIncMetric",
//!     ...
//!  }
//! }
//! ```
//! `musycc_<name>` holds the metrics of the card registered as `<name>` and `musycc` is the
//! aggregate of every card.
//!
//! Cards hold an `Arc` to their entry, so counters stay reachable for a flush even while the
//! card itself is busy.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::logger::{IncMetric, SharedIncMetric, extract_guard};

/// Map of card name to metrics.
#[derive(Debug)]
pub struct CardMetricsPerDevice {
    /// Per card metrics.
    pub metrics: BTreeMap<String, Arc<CardMetrics>>,
}

impl CardMetricsPerDevice {
    /// Returns the metrics of card `name`, allocating them on first use.
    pub fn alloc(name: String) -> Arc<CardMetrics> {
        Arc::clone(
            extract_guard(METRICS.write())
                .metrics
                .entry(name)
                .or_insert_with(|| Arc::new(CardMetrics::default())),
        )
    }

    /// Forgets the metrics of card `name` if they are still `metrics`.
    pub fn remove(name: &str, metrics: &Arc<CardMetrics>) {
        let mut guard = extract_guard(METRICS.write());
        if guard
            .metrics
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, metrics))
        {
            guard.metrics.remove(name);
        }
    }
}

static METRICS: RwLock<CardMetricsPerDevice> = RwLock::new(CardMetricsPerDevice {
    metrics: BTreeMap::new(),
});

/// Aggregates and serializes the per card metrics.
pub fn flush_metrics<S: Serializer>(serializer: S) -> Result<S::Ok, S::Error> {
    let card_metrics = extract_guard(METRICS.read());
    let metrics_len = card_metrics.metrics.len();
    // +1 for the aggregate.
    let mut seq = serializer.serialize_map(Some(1 + metrics_len))?;

    let mut aggregated = CardMetrics::default();

    for (name, metrics) in card_metrics.metrics.iter() {
        let devn = format!("musycc_{name}");
        // Serialization resets the counters, so aggregate first.
        let m: &CardMetrics = metrics;
        aggregated.aggregate(m);
        seq.serialize_entry(&devn, m)?;
    }
    seq.serialize_entry("musycc", &aggregated)?;
    seq.end()
}

/// Engine metrics of one card.
#[derive(Debug, Default, Serialize)]
pub struct CardMetrics {
    /// Top half runs.
    pub interrupts: SharedIncMetric,
    /// Top half runs that found no new entry.
    pub spurious_interrupts: SharedIncMetric,
    /// Status descriptors reporting a queue overflow.
    pub iq_overflows: SharedIncMetric,
    /// Entries flagged as following lost entries.
    pub iq_lost_entries: SharedIncMetric,
    /// Dispatched interrupt queue entries.
    pub iq_entries: SharedIncMetric,
    /// Queue slots skipped because they stayed empty.
    pub iq_sentinel_skips: SharedIncMetric,
    /// Device head differing from the host's expectation.
    pub iq_index_mismatches: SharedIncMetric,
    /// Entries naming a port that is not configured.
    pub iq_bad_group: SharedIncMetric,
    /// Service requests latched by the device.
    pub service_requests: SharedIncMetric,
    /// NOOPs written between two identical activations.
    pub sr_noop_inserted: SharedIncMetric,
    /// Service requests that never read back.
    pub sr_readback_failures: SharedIncMetric,
    /// Acknowledgements that did not arrive in time.
    pub sr_ack_timeouts: SharedIncMetric,
    /// Channel aborts reported.
    pub channel_aborts: SharedIncMetric,
    /// Channel idle events reported.
    pub channel_idles: SharedIncMetric,
    /// SS7 and frame recovery events reported.
    pub ss7_events: SharedIncMetric,
    /// Events with an unknown code.
    pub unknown_events: SharedIncMetric,
    /// Restart work items queued.
    pub restarts_scheduled: SharedIncMetric,
    /// Restart work items that reactivated a direction.
    pub restarts_performed: SharedIncMetric,
    /// Frames dropped by `start_xmit`.
    pub tx_dropped: SharedIncMetric,
    /// RX frames dropped because no replacement buffer was available.
    pub rx_alloc_failures: SharedIncMetric,
    /// Watchdog ticks.
    pub watchdog_ticks: SharedIncMetric,
    /// Line state changes seen by the watchdog.
    pub line_transitions: SharedIncMetric,
    /// Failed DMA memory accesses.
    pub dma_errors: SharedIncMetric,
}

impl CardMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the not yet flushed counts of `other` to `self`.
    pub fn aggregate(&mut self, other: &Self) {
        self.interrupts.add(other.interrupts.fetch_diff());
        self.spurious_interrupts
            .add(other.spurious_interrupts.fetch_diff());
        self.iq_overflows.add(other.iq_overflows.fetch_diff());
        self.iq_lost_entries.add(other.iq_lost_entries.fetch_diff());
        self.iq_entries.add(other.iq_entries.fetch_diff());
        self.iq_sentinel_skips
            .add(other.iq_sentinel_skips.fetch_diff());
        self.iq_index_mismatches
            .add(other.iq_index_mismatches.fetch_diff());
        self.iq_bad_group.add(other.iq_bad_group.fetch_diff());
        self.service_requests
            .add(other.service_requests.fetch_diff());
        self.sr_noop_inserted
            .add(other.sr_noop_inserted.fetch_diff());
        self.sr_readback_failures
            .add(other.sr_readback_failures.fetch_diff());
        self.sr_ack_timeouts.add(other.sr_ack_timeouts.fetch_diff());
        self.channel_aborts.add(other.channel_aborts.fetch_diff());
        self.channel_idles.add(other.channel_idles.fetch_diff());
        self.ss7_events.add(other.ss7_events.fetch_diff());
        self.unknown_events.add(other.unknown_events.fetch_diff());
        self.restarts_scheduled
            .add(other.restarts_scheduled.fetch_diff());
        self.restarts_performed
            .add(other.restarts_performed.fetch_diff());
        self.tx_dropped.add(other.tx_dropped.fetch_diff());
        self.rx_alloc_failures
            .add(other.rx_alloc_failures.fetch_diff());
        self.watchdog_ticks.add(other.watchdog_ticks.fetch_diff());
        self.line_transitions
            .add(other.line_transitions.fetch_diff());
        self.dma_errors.add(other.dma_errors.fetch_diff());
    }
}
