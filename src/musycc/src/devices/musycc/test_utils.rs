// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc(hidden)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vmm_sys_util::eventfd::EventFd;

use super::card::{Card, CardBus};
use super::channel::ChannelUser;
use super::emulation::{EmulatedFramer, EmulatedMusycc};
use crate::config::{CardConfig, RetryPolicy};
use crate::dma::{DmaMemory, MemToken};

pub const DMA_BASE: u64 = 0x100_0000;
pub const DMA_SIZE: usize = 0x20_0000;

static CARD_ID: AtomicUsize = AtomicUsize::new(0);

/// Small card with tight timeouts, named uniquely so metrics do not mix between tests.
pub fn test_config() -> CardConfig {
    CardConfig {
        name: format!("test{}", CARD_ID.fetch_add(1, Ordering::Relaxed)),
        ports: 2,
        iq_size: 256,
        txdesc_base: 4,
        rxdesc_base: 4,
        max_mru: 256,
        retry: RetryPolicy {
            reset_settle_ms: 1,
            ack_timeout_ms: Some(2000),
            ..Default::default()
        },
        watchdog_interval_ms: 10,
        dma_pool_size: DMA_SIZE as u64,
        ..Default::default()
    }
}

/// A running card wired to an emulated controller.
#[derive(Debug)]
pub struct Fixture {
    pub card: Card,
    pub emu: Arc<EmulatedMusycc>,
    pub framer: Arc<EmulatedFramer>,
    pub mem: DmaMemory,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CardConfig) -> Self {
        let fx = Self::uninit(config);
        fx.card.init().unwrap();
        fx
    }

    pub fn uninit(config: CardConfig) -> Self {
        let mem = DmaMemory::anonymous(DMA_BASE, DMA_SIZE).unwrap();
        let irq = EventFd::new(0).unwrap();
        let emu = Arc::new(EmulatedMusycc::new(mem.clone(), irq.try_clone().unwrap()));
        let framer = Arc::new(EmulatedFramer::new(config.ports));
        let card = Card::new(
            config,
            CardBus {
                regs: emu.clone(),
                irq,
                mem: mem.clone(),
                dma_base: DMA_BASE,
                framer: framer.clone(),
            },
        )
        .unwrap();
        Fixture {
            card,
            emu,
            framer,
            mem,
        }
    }

    /// A TX frame made of `parts`, one segment each.
    pub fn frame(&self, parts: &[&[u8]]) -> MemToken {
        MemToken::from_segments(self.card.dma_pool(), parts).unwrap()
    }
}

/// Polls `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Channel user recording every callback.
#[derive(Debug, Default)]
pub struct RecordingUser {
    pub received: Mutex<Vec<Vec<u8>>>,
    pub enables: AtomicUsize,
    pub disables: AtomicUsize,
    pub ups: AtomicUsize,
    pub downs: AtomicUsize,
}

impl RecordingUser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn line_ups(&self) -> usize {
        self.ups.load(Ordering::SeqCst)
    }

    pub fn line_downs(&self) -> usize {
        self.downs.load(Ordering::SeqCst)
    }
}

impl ChannelUser for RecordingUser {
    fn recv_consume(&self, token: MemToken, len: usize) {
        let mut data = token.to_vec().unwrap();
        data.truncate(len);
        self.received.lock().unwrap().push(data);
    }

    fn enable_xmit(&self) {
        self.enables.fetch_add(1, Ordering::SeqCst);
    }

    fn disable_xmit(&self) {
        self.disables.fetch_add(1, Ordering::SeqCst);
    }

    fn line_is_up(&self) {
        self.ups.fetch_add(1, Ordering::SeqCst);
    }

    fn line_is_down(&self) {
        self.downs.fetch_add(1, Ordering::SeqCst);
    }
}
