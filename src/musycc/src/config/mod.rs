// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration of a card, its ports and its channels.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod channel;
pub mod port;

pub use self::channel::{ChannelMode, ChannelParams, IdleCode, TIMESLOTS};
pub use self::port::{ClockSource, FramerAccess, LineMode, LoopbackMode, PortParams};
pub use crate::logger::LoggerConfig;

/// Number of ports (framer groups) a controller drives at most.
pub const MAX_PORTS: u8 = 8;
/// Largest interrupt queue the status register can describe.
pub const MAX_IQ_SIZE: u32 = 0x4000;
/// Largest descriptor ring per channel direction.
pub const MAX_RING_LEN: u16 = 255;
/// Largest length the 14-bit descriptor length field can carry.
pub const MAX_BUFFER_LEN: usize = 0x3FFF;

/// Default card name.
pub const DEFAULT_CARD_NAME: &str = "card0";
/// Default number of interrupt queue entries.
pub const DEFAULT_IQ_SIZE: u32 = 0x1000;
/// Default TX descriptor baseline per channel.
pub const DEFAULT_TXDESC_BASE: u16 = 10;
/// Default RX descriptor baseline per channel.
pub const DEFAULT_RXDESC_BASE: u16 = 18;
/// Default receive buffer size in bytes.
pub const DEFAULT_MAX_MRU: usize = 1600;
/// Default watchdog period in milliseconds.
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1000;
/// Default size of the DMA pool in bytes.
pub const DEFAULT_DMA_POOL_SIZE: u64 = 8 << 20;

/// Errors associated with the card configuration.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid JSON configuration: {0}
    Json(String),
    /// The number of ports must be between 1 and 8, got {0}.
    InvalidPortCount(u8),
    /// The interrupt queue size must be a power of two between 2 and 16384, got {0}.
    InvalidIqSize(u32),
    /// Descriptor baselines must be between 1 and 255, got TX {0} / RX {1}.
    InvalidDescriptorBase(u16, u16),
    /// The maximum receive unit must be between 1 and 16383 bytes, got {0}.
    InvalidMru(usize),
    /// The watchdog interval must not be zero.
    InvalidWatchdogInterval,
}

/// Retry and timeout limits of the hardware handshakes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Additional service request writes after a failed read-back.
    pub sr_retries: u32,
    /// Polls of a still device-owned TX descriptor before reclaim gives up.
    pub tx_owned_polls: u32,
    /// Polls of an empty interrupt queue slot before it is skipped.
    pub iq_sentinel_polls: u32,
    /// Sleep after a chip reset, in milliseconds.
    pub reset_settle_ms: u64,
    /// Bound on the wait for a service request acknowledgement, in milliseconds.
    pub ack_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            sr_retries: 9,
            tx_owned_polls: 40,
            iq_sentinel_polls: 0x30,
            reset_settle_ms: 20,
            ack_timeout_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Sleep after a chip reset.
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Bound on acknowledgement waits, `None` waits forever.
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }
}

/// Where the interrupt bottom half runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum BottomHalfPolicy {
    /// On the interrupt thread, right after the top half.
    Inline,
    /// On a dedicated worker thread woken by the top half.
    #[default]
    Deferred,
}

fn default_name() -> String {
    String::from(DEFAULT_CARD_NAME)
}
fn default_ports() -> u8 {
    MAX_PORTS
}
fn default_iq_size() -> u32 {
    DEFAULT_IQ_SIZE
}
fn default_txdesc_base() -> u16 {
    DEFAULT_TXDESC_BASE
}
fn default_rxdesc_base() -> u16 {
    DEFAULT_RXDESC_BASE
}
fn default_max_mru() -> usize {
    DEFAULT_MAX_MRU
}
fn default_watchdog_interval_ms() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL_MS
}
fn default_dma_pool_size() -> u64 {
    DEFAULT_DMA_POOL_SIZE
}

/// Strongly typed structure describing a card.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CardConfig {
    /// Card name, used in logs and metrics.
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of ports wired to framers.
    #[serde(default = "default_ports")]
    pub ports: u8,
    /// Number of interrupt queue entries.
    #[serde(default = "default_iq_size")]
    pub iq_size: u32,
    /// TX descriptors per channel before scaling with the timeslot count.
    #[serde(default = "default_txdesc_base")]
    pub txdesc_base: u16,
    /// RX descriptors per channel before scaling with the timeslot count.
    #[serde(default = "default_rxdesc_base")]
    pub rxdesc_base: u16,
    /// Receive buffer size.
    #[serde(default = "default_max_mru")]
    pub max_mru: usize,
    /// Hardware handshake limits.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Where the interrupt bottom half runs.
    #[serde(default)]
    pub bottom_half: BottomHalfPolicy,
    /// Alarm polling period in milliseconds.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    /// Bytes of DMA memory reserved for rings, queue and buffers.
    #[serde(default = "default_dma_pool_size")]
    pub dma_pool_size: u64,
}

impl Default for CardConfig {
    fn default() -> Self {
        CardConfig {
            name: default_name(),
            ports: default_ports(),
            iq_size: default_iq_size(),
            txdesc_base: default_txdesc_base(),
            rxdesc_base: default_rxdesc_base(),
            max_mru: default_max_mru(),
            retry: RetryPolicy::default(),
            bottom_half: BottomHalfPolicy::default(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            dma_pool_size: default_dma_pool_size(),
        }
    }
}

impl CardConfig {
    /// Parses and validates a JSON card description.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CardConfig =
            serde_json::from_str(json).map_err(|err| ConfigError::Json(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field against the hardware limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports == 0 || self.ports > MAX_PORTS {
            return Err(ConfigError::InvalidPortCount(self.ports));
        }
        if self.iq_size < 2 || self.iq_size > MAX_IQ_SIZE || !self.iq_size.is_power_of_two() {
            return Err(ConfigError::InvalidIqSize(self.iq_size));
        }
        let base_ok = |b: u16| (1..=MAX_RING_LEN).contains(&b);
        if !base_ok(self.txdesc_base) || !base_ok(self.rxdesc_base) {
            return Err(ConfigError::InvalidDescriptorBase(
                self.txdesc_base,
                self.rxdesc_base,
            ));
        }
        if self.max_mru == 0 || self.max_mru > MAX_BUFFER_LEN {
            return Err(ConfigError::InvalidMru(self.max_mru));
        }
        if self.watchdog_interval_ms == 0 {
            return Err(ConfigError::InvalidWatchdogInterval);
        }
        Ok(())
    }

    /// Watchdog period.
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// TX ring length for a channel using `nts` timeslots.
    pub fn tx_ring_len(&self, nts: usize) -> u16 {
        ring_len(self.txdesc_base, nts)
    }

    /// RX ring length for a channel using `nts` timeslots.
    pub fn rx_ring_len(&self, nts: usize) -> u16 {
        ring_len(self.rxdesc_base, nts)
    }
}

fn ring_len(base: u16, nts: usize) -> u16 {
    let base = usize::from(base);
    let len = base + base * nts / 8;
    u16::try_from(len.min(usize::from(MAX_RING_LEN))).unwrap_or(MAX_RING_LEN)
}
