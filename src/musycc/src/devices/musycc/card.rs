// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The card: ports, the interrupt queue, and the threads serving them.
//!
//! Four threads serve a running card:
//! - the interrupt thread blocks on the interrupt `EventFd` and runs the top half, plus the
//!   bottom half when [`BottomHalfPolicy::Inline`] is configured;
//! - the bottom half thread drains the interrupt queue when woken by the top half;
//! - the restart worker reactivates channel directions the device stopped;
//! - the watchdog polls the framer alarms.
//!
//! Locks are taken port state first, channel second, and never held across a service request
//! wait. User callbacks run once every engine lock is released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use vmm_sys_util::eventfd::EventFd;

use super::channel::{
    Channel, ChannelError, ChannelInfo, ChannelState, ChannelStats, ChannelUser, RestartReason,
    XmitError, XmitOutcome,
};
use super::descriptor::Direction;
use super::interrupt::{
    ErrorCode, Event, IntLog, IntLogSnapshot, InterruptQueue, IntrEntry, IsdStatus,
    is_empty_entry,
};
use super::locked;
use super::metrics::{CardMetrics, CardMetricsPerDevice};
use super::port::{FifoAlloc, Port, PortInfo, fifo_request};
use super::regs::*;
use super::restart::{self, RestartWork};
use super::service::{ServiceRequest, ServiceRequestError, SrOp};
use super::watchdog;
use crate::config::{
    BottomHalfPolicy, CardConfig, ChannelParams, ConfigError, FramerAccess, LoopbackMode,
    PortParams,
};
use crate::devices::framer::{Framer, FramerError};
use crate::dma::{DmaError, DmaMemory, DmaPool, MemToken};
use crate::logger::{IncMetric, debug, error, info, warn};

/// Errors of card construction and initialization.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum CardError {
    /// Invalid configuration: {0}
    Config(#[from] ConfigError),
    /// DMA failure: {0}
    Dma(#[from] DmaError),
    /// Service request failure: {0}
    ServiceRequest(#[from] ServiceRequestError),
    /// Framer failure: {0}
    Framer(#[from] FramerError),
    /// Cannot create an event fd: {0}
    EventFd(std::io::Error),
    /// Cannot spawn thread: {0}
    Spawn(std::io::Error),
    /// Card is {0:?}, operation needs it {1:?}
    InvalidState(CardState, CardState),
    /// Channel operation failed: {0}
    Channel(#[from] ChannelError),
}

impl CardError {
    /// Positive errno value matching the error.
    pub fn errno(&self) -> i32 {
        match self {
            CardError::Config(_) => libc::EINVAL,
            CardError::Dma(DmaError::Allocate(_)) => libc::ENOBUFS,
            CardError::Dma(_)
            | CardError::ServiceRequest(_)
            | CardError::Framer(_)
            | CardError::EventFd(_)
            | CardError::Spawn(_) => libc::EIO,
            CardError::InvalidState(..) => libc::EBUSY,
            CardError::Channel(err) => err.errno(),
        }
    }
}

/// Lifecycle of a card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CardState {
    /// Constructed, hardware untouched.
    Init,
    /// Chip initialized, ports not yet.
    Idle,
    /// Accepting channel operations.
    Running,
}

/// What a card needs from its environment.
#[derive(Debug)]
pub struct CardBus {
    /// Register window of the controller.
    pub regs: Arc<dyn RegisterBus>,
    /// Interrupt line, signalled by the device.
    pub irq: EventFd,
    /// Memory the device masters.
    pub mem: DmaMemory,
    /// Bus address where the card's DMA pool starts.
    pub dma_base: u64,
    /// Framers of the ports.
    pub framer: Arc<dyn Framer>,
}

/// Snapshot of a card for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CardInfo {
    /// Card name.
    pub name: String,
    /// Lifecycle state.
    pub state: CardState,
    /// Bytes queued for transmission on every channel.
    pub tx_pending: u64,
    /// Interrupt queue entries.
    pub iq_size: u32,
    /// Next entry the bottom half dispatches.
    pub iq_head: u32,
    /// One past the last entry published by the top half.
    pub iq_tail: u32,
    /// Interrupt log.
    pub intlog: IntLogSnapshot,
    /// Ports.
    pub ports: Vec<PortInfo>,
}

// Deferred user notifications, run without any engine lock.
enum Notify {
    Receive(Arc<dyn ChannelUser>, MemToken, usize),
    EnableXmit(Arc<dyn ChannelUser>),
}

impl Notify {
    fn run(self) {
        match self {
            Notify::Receive(user, token, len) => user.recv_consume(token, len),
            Notify::EnableXmit(user) => user.enable_xmit(),
        }
    }
}

/// State shared between a card handle and its threads.
#[derive(Debug)]
pub(crate) struct CardShared {
    pub config: CardConfig,
    pub regs: Arc<dyn RegisterBus>,
    pub pool: Arc<DmaPool>,
    pub framer: Arc<dyn Framer>,
    pub metrics: Arc<CardMetrics>,
    pub ports: Vec<Port>,
    pub iq: InterruptQueue,
    pub intlog: IntLog,
    pub state: Mutex<CardState>,
    pub irq: EventFd,
    pub bh_evt: EventFd,
    pub stop: AtomicBool,
    pub restart_tx: Mutex<Option<Sender<RestartWork>>>,
    pub watchdog_tx: Mutex<Option<Sender<()>>>,
    pub tx_pending: AtomicU64,
    // Channel number to (port, channel in port).
    pub channums: Mutex<BTreeMap<u32, (u8, u8)>>,
}

/// A MUSYCC card.
#[derive(Debug)]
pub struct Card {
    shared: Arc<CardShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

fn cct(params: &ChannelParams, fifo: FifoAlloc, invert: bool) -> u32 {
    let mut word = params.mode.protocol_code() << CCT_PROTO_S
        | u32::from(params.intr_mask) << CCT_INTR_MASK_S
        | u32::from(fifo.start) << CCT_BUFFLOC_S
        | u32::from(fifo.len.saturating_sub(1)) << CCT_BUFFLEN_S;
    if invert {
        word |= CCT_INVERT;
    }
    word
}

impl CardShared {
    /// Issues a service request, logging rather than returning a failure.
    pub(crate) fn issue(&self, port: &Port, req: ServiceRequest) -> bool {
        match port.sr.serv_req(req) {
            Ok(()) => true,
            Err(err) => {
                error!("musycc: {}: {err}", self.config.name);
                false
            }
        }
    }

    pub(crate) fn running(&self) -> bool {
        *locked(&self.state) == CardState::Running
    }

    fn lookup(&self, channum: u32) -> Result<(&Port, u8), ChannelError> {
        if channum >= MAX_CHANS_USED {
            return Err(ChannelError::ChannelOutOfRange(channum));
        }
        let (port, gchan) = locked(&self.channums)
            .get(&channum)
            .copied()
            .ok_or(ChannelError::NoSuchChannel(channum))?;
        let port = self
            .ports
            .get(usize::from(port))
            .ok_or(ChannelError::NoSuchPort(port))?;
        Ok((port, gchan))
    }

    fn port(&self, portnum: u8) -> Result<&Port, ChannelError> {
        self.ports
            .get(usize::from(portnum))
            .ok_or(ChannelError::NoSuchPort(portnum))
    }

    /// Queues restart work for a channel unless some is already queued.
    pub(crate) fn chan_restart(&self, portnum: u8, ch: &mut Channel) {
        if ch.restart_queued {
            return;
        }
        let sender = locked(&self.restart_tx);
        let Some(sender) = sender.as_ref() else {
            return;
        };
        let work = RestartWork {
            port: portnum,
            gchan: ch.gchan,
            generation: ch.generation,
        };
        if sender.send(work).is_ok() {
            ch.restart_queued = true;
            self.metrics.restarts_scheduled.inc();
        }
    }

    /// Top half: publishes the entries the device added since the last run.
    ///
    /// Returns whether the bottom half has work.
    pub(crate) fn intr_th_handler(&self) -> bool {
        let raw = self.regs.read32(ISD);
        let isd = IsdStatus::decode(raw);
        self.intlog.last_isd.store(raw, Ordering::Relaxed);
        self.intlog.top_half.fetch_add(1, Ordering::Relaxed);
        self.metrics.interrupts.inc();

        if isd.count == 0 {
            self.metrics.spurious_interrupts.inc();
            debug!("musycc: {}: spurious interrupt", self.config.name);
            return false;
        }
        if isd.overflow {
            self.metrics.iq_overflows.inc();
            warn!("musycc: {}: interrupt queue overflow", self.config.name);
        }

        let size = self.iq.size();
        let tail = u32::from(isd.next) % size;
        let expected = (self.iq.tail() + u32::from(isd.count)) % size;
        if tail != expected {
            self.metrics.iq_index_mismatches.inc();
            debug!(
                "musycc: {}: device head {tail} but {} new entries after {} give {expected}",
                self.config.name,
                isd.count,
                self.iq.tail()
            );
        }
        self.iq.set_tail(tail);
        self.regs.write32(ISD, raw);
        true
    }

    /// Bottom half: dispatches every published entry in queue order.
    pub(crate) fn intr_bh(&self) {
        let _guard = locked(&self.iq.bh_lock);
        self.intlog.bottom_half.fetch_add(1, Ordering::Relaxed);

        while self.iq.head() != self.iq.tail() {
            let head = self.iq.head();
            match self.read_entry(head) {
                Ok(Some(raw)) => self.dispatch(IntrEntry::decode(raw)),
                Ok(None) => {
                    self.metrics.iq_sentinel_skips.inc();
                    warn!(
                        "musycc: {}: interrupt queue entry {head} stayed empty, skipped",
                        self.config.name
                    );
                }
                Err(err) => {
                    self.metrics.dma_errors.inc();
                    error!("musycc: {}: interrupt queue read: {err}", self.config.name);
                }
            }
            if let Err(err) = self.iq.recycle(head) {
                self.metrics.dma_errors.inc();
                error!("musycc: {}: interrupt queue write: {err}", self.config.name);
            }
            self.iq.advance_head();
        }
    }

    // The entry may still read as empty when its DMA write is not visible yet.
    fn read_entry(&self, index: u32) -> Result<Option<u32>, DmaError> {
        let mut raw = self.iq.read(index)?;
        let mut polls = 0;
        while is_empty_entry(raw) {
            if polls >= self.config.retry.iq_sentinel_polls {
                return Ok(None);
            }
            polls += 1;
            std::hint::spin_loop();
            thread::yield_now();
            raw = self.iq.read(index)?;
        }
        Ok(Some(raw))
    }

    fn dispatch(&self, entry: IntrEntry) {
        self.metrics.iq_entries.inc();
        if entry.lost {
            self.metrics.iq_lost_entries.inc();
            debug!(
                "musycc: {}: entries lost before {entry:?}",
                self.config.name
            );
        }
        let Some(port) = self.ports.get(usize::from(entry.group)) else {
            self.metrics.iq_bad_group.inc();
            warn!(
                "musycc: {}: interrupt for unknown group {}",
                self.config.name, entry.group
            );
            return;
        };

        match entry.event {
            Event::ServiceAck => port.sr.complete(),
            Event::EndOfBuffer | Event::EndOfMessage => self.bh_eom(port, &entry),
            Event::ChannelAbort => {
                self.metrics.channel_aborts.inc();
                if entry.direction == Direction::Tx {
                    locked(&port.channels[usize::from(entry.channel)])
                        .stats
                        .tx_aborted_errors += 1;
                }
                debug!(
                    "musycc: {}: port {} channel {} {:?} abort",
                    self.config.name, port.portnum, entry.channel, entry.direction
                );
            }
            Event::ChannelIdle => {
                self.metrics.channel_idles.inc();
                debug!(
                    "musycc: {}: port {} channel {} idle",
                    self.config.name, port.portnum, entry.channel
                );
            }
            Event::FrameRecovery
            | Event::SuermIncrement
            | Event::SuermDecrement
            | Event::Ss7Filtered => {
                self.metrics.ss7_events.inc();
                debug!("musycc: {}: {:?}", self.config.name, entry.event);
            }
            Event::EndOfPadfill | Event::None => {}
            Event::Unknown(code) => {
                self.metrics.unknown_events.inc();
                warn!(
                    "musycc: {}: unknown event {code:#x} in {entry:?}",
                    self.config.name
                );
            }
        }

        match entry.error {
            ErrorCode::None => {}
            ErrorCode::Buffer | ErrorCode::Overrun => self.bh_error(port, &entry),
            other => debug!(
                "musycc: {}: port {} channel {} {:?} error {other:?}",
                self.config.name, port.portnum, entry.channel, entry.direction
            ),
        }
    }

    fn bh_eom(&self, port: &Port, entry: &IntrEntry) {
        let mut notify = Vec::new();
        {
            let mut ch = locked(&port.channels[usize::from(entry.channel)]);
            if ch.state != ChannelState::Up {
                return;
            }
            match entry.direction {
                Direction::Tx => self.bh_tx_eom(&mut ch, &mut notify),
                Direction::Rx => self.bh_rx_eom(&mut ch, &mut notify),
            }
        }
        notify.into_iter().for_each(Notify::run);
    }

    fn bh_tx_eom(&self, ch: &mut Channel, notify: &mut Vec<Notify>) {
        match ch.reclaim_tx(self.config.retry.tx_owned_polls, &self.tx_pending) {
            Ok(reclaim) => {
                if reclaim.wake {
                    if let Some(user) = ch.user.clone() {
                        notify.push(Notify::EnableXmit(user));
                    }
                }
            }
            Err(err) => {
                self.metrics.dma_errors.inc();
                error!("musycc: {}: TX reclaim: {err}", self.config.name);
            }
        }
    }

    fn bh_rx_eom(&self, ch: &mut Channel, notify: &mut Vec<Notify>) {
        match ch.reclaim_rx(&self.pool) {
            Ok(reclaim) => {
                self.metrics.rx_alloc_failures.add(reclaim.alloc_failures);
                if let Some(user) = ch.user.clone() {
                    for (token, len) in reclaim.delivered {
                        notify.push(Notify::Receive(user.clone(), token, len));
                    }
                }
            }
            Err(err) => {
                self.metrics.dma_errors.inc();
                error!("musycc: {}: RX reclaim: {err}", self.config.name);
            }
        }
    }

    fn bh_error(&self, port: &Port, entry: &IntrEntry) {
        let reason = match entry.error {
            ErrorCode::Overrun => RestartReason::Overrun,
            _ => RestartReason::BufferError,
        };
        let mut notify = Vec::new();
        {
            let mut ch = locked(&port.channels[usize::from(entry.channel)]);
            if ch.state != ChannelState::Up {
                return;
            }
            match entry.direction {
                Direction::Tx => {
                    ch.stats.tx_fifo_errors += 1;
                    ch.ch_start_tx = Some(reason);
                }
                Direction::Rx => {
                    match reason {
                        RestartReason::Overrun => ch.stats.rx_fifo_errors += 1,
                        _ => ch.stats.rx_over_errors += 1,
                    }
                    // Hand back what was received before reactivating.
                    self.bh_rx_eom(&mut ch, &mut notify);
                    ch.ch_start_rx = Some(reason);
                }
            }
            info!(
                "musycc: {}: port {} channel {:?} {:?} stopped on {:?}, restarting",
                self.config.name, port.portnum, ch.channum, entry.direction, entry.error
            );
            self.chan_restart(port.portnum, &mut ch);
        }
        notify.into_iter().for_each(Notify::run);
    }
}

impl Card {
    /// Builds a card. The hardware is left untouched until [`Card::init`].
    pub fn new(config: CardConfig, bus: CardBus) -> Result<Self, CardError> {
        config.validate()?;
        let pool = DmaPool::new(bus.mem, bus.dma_base, config.dma_pool_size)?;
        let iq = InterruptQueue::new(&pool, config.iq_size)?;
        let metrics = CardMetricsPerDevice::alloc(config.name.clone());
        let ports = (0..config.ports)
            .map(|portnum| Port::new(portnum, bus.regs.clone(), config.retry, metrics.clone()))
            .collect();
        let bh_evt = EventFd::new(0).map_err(CardError::EventFd)?;

        Ok(Card {
            shared: Arc::new(CardShared {
                config,
                regs: bus.regs,
                pool,
                framer: bus.framer,
                metrics,
                ports,
                iq,
                intlog: IntLog::default(),
                state: Mutex::new(CardState::Init),
                irq: bus.irq,
                bh_evt,
                stop: AtomicBool::new(false),
                restart_tx: Mutex::new(None),
                watchdog_tx: Mutex::new(None),
                tx_pending: AtomicU64::new(0),
                channums: Mutex::new(BTreeMap::new()),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Card name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Engine counters of the card.
    pub fn metrics(&self) -> &Arc<CardMetrics> {
        &self.shared.metrics
    }

    /// Pool the card's rings and buffers come from. TX frames must be allocated from it too.
    pub fn dma_pool(&self) -> &Arc<DmaPool> {
        &self.shared.pool
    }

    /// Lifecycle state.
    pub fn state(&self) -> CardState {
        *locked(&self.shared.state)
    }

    fn spawn<F>(&self, role: &str, body: F) -> Result<(), CardError>
    where
        F: FnOnce(Arc<CardShared>) + Send + 'static,
    {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("musycc_{}_{role}", self.shared.config.name))
            .spawn(move || body(shared))
            .map_err(CardError::Spawn)?;
        locked(&self.threads).push(handle);
        Ok(())
    }

    fn spawn_threads(&self) -> Result<(), CardError> {
        let inline = self.shared.config.bottom_half == BottomHalfPolicy::Inline;
        self.spawn("irq", move |shared| {
            while shared.irq.read().is_ok() {
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                if !shared.intr_th_handler() {
                    continue;
                }
                if inline {
                    shared.intr_bh();
                } else if let Err(err) = shared.bh_evt.write(1) {
                    error!("musycc: {}: cannot wake bottom half: {err}", shared.config.name);
                }
            }
        })?;
        if !inline {
            self.spawn("bh", |shared| {
                while shared.bh_evt.read().is_ok() {
                    if shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    shared.intr_bh();
                }
            })?;
        }

        let (restart_tx, restart_rx) = mpsc::channel();
        *locked(&self.shared.restart_tx) = Some(restart_tx);
        self.spawn("restart", move |shared| restart::run(&shared, &restart_rx))?;

        let (watchdog_tx, watchdog_rx) = mpsc::channel();
        *locked(&self.shared.watchdog_tx) = Some(watchdog_tx);
        self.spawn("watchdog", move |shared| {
            watchdog::run(&shared, &watchdog_rx)
        })?;
        Ok(())
    }

    /// Resets the chip, loads the interrupt queue and initializes every port.
    pub fn init(&self) -> Result<(), CardError> {
        let shared = &self.shared;
        {
            let state = *locked(&shared.state);
            if state != CardState::Init {
                return Err(CardError::InvalidState(state, CardState::Init));
            }
        }
        self.spawn_threads()?;

        let Some(global) = shared.ports.first() else {
            return Err(ConfigError::InvalidPortCount(0).into());
        };
        global.sr.serv_req(ServiceRequest::group(SrOp::ChipReset))?;
        shared.regs.write32(IQP, shared.iq.base());
        shared.regs.write32(IQL, shared.iq.size() - 1);
        shared.regs.write32(GLOBAL_CONFIG, 0);
        global.sr.serv_req(ServiceRequest::group(SrOp::GlobalInit))?;
        *locked(&shared.state) = CardState::Idle;

        for port in &shared.ports {
            let mut state = locked(&port.state);
            if let Err(err) = shared.framer.init_comet(port.portnum, &state.params) {
                warn!(
                    "musycc: {}: port {} framer init failed: {err}",
                    shared.config.name, port.portnum
                );
            }
            let pcd = state.params.pcd();
            port.write_reg(&mut state, PCD, pcd);
            port.write_reg(&mut state, MLD, 0);
            port.write_tsm(&mut state);
            drop(state);
            shared.issue(port, ServiceRequest::group(SrOp::GroupInit));
        }
        *locked(&shared.state) = CardState::Running;
        info!(
            "musycc: {}: running with {} ports",
            shared.config.name,
            shared.ports.len()
        );
        Ok(())
    }

    /// Binds channel number `channum` to a free channel of `portnum`.
    pub fn new_chan(
        &self,
        portnum: u8,
        channum: u32,
        user: Arc<dyn ChannelUser>,
    ) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let port = shared.port(portnum)?;
        if channum >= MAX_CHANS_USED {
            return Err(ChannelError::ChannelOutOfRange(channum));
        }
        let mut channums = locked(&shared.channums);
        if channums.contains_key(&channum) {
            return Err(ChannelError::ChannelExists(channum));
        }
        for slot in &port.channels {
            let mut ch = locked(slot);
            if ch.state == ChannelState::Unassigned {
                ch.state = ChannelState::Down;
                ch.channum = Some(channum);
                ch.user = Some(user);
                ch.params = ChannelParams::default();
                ch.stats = ChannelStats::default();
                channums.insert(channum, (portnum, ch.gchan));
                return Ok(());
            }
        }
        Err(ChannelError::NoFreeSlot(portnum))
    }

    /// Unbinds a channel, bringing it down first.
    pub fn del_chan(&self, channum: u32) -> Result<(), ChannelError> {
        self.chan_down(channum)?;
        let shared = &self.shared;
        let (port, gchan) = shared.lookup(channum)?;
        {
            let mut ch = locked(&port.channels[usize::from(gchan)]);
            ch.state = ChannelState::Unassigned;
            ch.channum = None;
            ch.user = None;
            ch.generation += 1;
        }
        locked(&shared.channums).remove(&channum);
        Ok(())
    }

    /// Starts a channel: FIFO space, configuration, rings, timeslots and RX activation.
    ///
    /// TX is activated by the restart worker once the first frame is queued.
    pub fn chan_up(&self, channum: u32) -> Result<(), ChannelError> {
        let shared = &self.shared;
        if !shared.running() {
            return Err(ChannelError::NotRunning);
        }
        let (port, gchan) = shared.lookup(channum)?;
        let rx_enabled = {
            let mut state = locked(&port.state);
            let mut ch = locked(&port.channels[usize::from(gchan)]);
            if ch.state == ChannelState::Up || ch.tx.is_some() {
                return Err(ChannelError::AlreadyUp(channum));
            }
            if state.overlaps(gchan, &ch.params) {
                return Err(ChannelError::TimeslotOverlap(channum));
            }
            let nts = ch.params.timeslot_count();
            if nts == 0 {
                return Err(ChannelError::NoTimeslots(channum));
            }
            let fifo = state
                .fifo_alloc(gchan, fifo_request(nts))
                .ok_or(ChannelError::NoFifoSpace(port.portnum))?;

            if let Err(err) = ch
                .alloc_rings(&shared.pool, &shared.config)
                .and_then(|()| ch.post_rx_buffers(&shared.pool))
            {
                state.fifo_free(gchan);
                drop(ch.teardown_rings(&shared.tx_pending));
                return Err(err.into());
            }

            let rcct = cct(&ch.params, fifo, ch.params.inv_rx);
            let tcct = cct(&ch.params, fifo, ch.params.inv_tx);
            port.write_chan_reg(&mut state, RCCT, gchan, rcct);
            port.write_chan_reg(&mut state, TCCT, gchan, tcct);
            let rhp = ch.rx.as_ref().map_or(0, |rx| rx.ring.base());
            let thp = ch.tx.as_ref().map_or(0, |tx| tx.ring.base());
            port.write_chan_reg(&mut state, RHP, gchan, rhp);
            port.write_chan_reg(&mut state, RMP, gchan, rhp);
            port.write_chan_reg(&mut state, THP, gchan, thp);
            port.write_chan_reg(&mut state, TMP, gchan, thp);

            state.activate_timeslots(gchan, ch.params.bitmask);
            port.write_tsm(&mut state);
            state.open_chans += 1;

            ch.fifo = Some(fifo);
            ch.state = ChannelState::Up;
            ch.generation += 1;
            ch.restart_queued = false;
            ch.ch_start_rx = None;
            ch.ch_start_tx = ch
                .params
                .tx_enabled
                .then_some(RestartReason::FirstActivation);
            ch.params.rx_enabled
        };

        shared.issue(
            port,
            ServiceRequest::new(SrOp::ChannelConfig, Direction::Rx, gchan),
        );
        shared.issue(
            port,
            ServiceRequest::new(SrOp::ChannelConfig, Direction::Tx, gchan),
        );
        shared.issue(
            port,
            ServiceRequest::new(SrOp::TsmUpdate, Direction::Rx, gchan),
        );
        if rx_enabled {
            shared.issue(
                port,
                ServiceRequest::new(SrOp::ChannelActivate, Direction::Rx, gchan),
            );
        }
        info!(
            "musycc: {}: channel {channum} up on port {} channel {gchan}",
            shared.config.name, port.portnum
        );
        Ok(())
    }

    /// Stops a channel and releases its rings, buffers, FIFO space and timeslots.
    pub fn chan_down(&self, channum: u32) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let (port, gchan) = shared.lookup(channum)?;
        {
            let _restart = locked(&port.restarts[usize::from(gchan)]);
            let mut ch = locked(&port.channels[usize::from(gchan)]);
            if ch.state != ChannelState::Up {
                return Ok(());
            }
            // From here on the bottom half and the restart worker leave the channel alone.
            ch.state = ChannelState::Down;
            ch.generation += 1;
            ch.restart_queued = false;
            ch.ch_start_rx = None;
            ch.ch_start_tx = None;
        }

        for direction in [Direction::Rx, Direction::Tx] {
            shared.issue(
                port,
                ServiceRequest::new(SrOp::ChannelDeactivate, direction, gchan),
            );
        }

        let tokens = {
            let mut state = locked(&port.state);
            let mut ch = locked(&port.channels[usize::from(gchan)]);
            for table in [THP, TMP, RHP, RMP] {
                port.write_chan_reg(&mut state, table, gchan, 0);
            }
            let tokens = ch.teardown_rings(&shared.tx_pending);
            state.fifo_free(gchan);
            ch.fifo = None;
            state.release_timeslots(gchan);
            port.write_tsm(&mut state);
            state.open_chans = state.open_chans.saturating_sub(1);
            tokens
        };
        shared.issue(
            port,
            ServiceRequest::new(SrOp::TsmUpdate, Direction::Rx, gchan),
        );
        debug!(
            "musycc: {}: channel {channum} down, {} buffers released",
            shared.config.name,
            tokens.len()
        );
        drop(tokens);
        Ok(())
    }

    /// Changes the parameters of a channel, cycling it through DOWN when running hardware
    /// state depends on them.
    pub fn set_chan(&self, channum: u32, params: ChannelParams) -> Result<(), ChannelError> {
        let (port, gchan) = self.shared.lookup(channum)?;
        {
            let mut ch = locked(&port.channels[usize::from(gchan)]);
            if ch.state != ChannelState::Up {
                ch.params = params;
                return Ok(());
            }
            if !ch.params.needs_restart(&params) && ch.tx_idle() {
                ch.params = params;
                return Ok(());
            }
        }
        self.chan_down(channum)?;
        locked(&port.channels[usize::from(gchan)]).params = params;
        self.chan_up(channum)
    }

    /// Parameters of a channel.
    pub fn get_chan(&self, channum: u32) -> Result<ChannelParams, ChannelError> {
        let (port, gchan) = self.shared.lookup(channum)?;
        Ok(locked(&port.channels[usize::from(gchan)]).params.clone())
    }

    /// Statistics of a channel.
    pub fn get_chan_stats(&self, channum: u32) -> Result<ChannelStats, ChannelError> {
        let (port, gchan) = self.shared.lookup(channum)?;
        Ok(locked(&port.channels[usize::from(gchan)]).stats)
    }

    /// Resets the statistics of a channel.
    pub fn del_chan_stats(&self, channum: u32) -> Result<(), ChannelError> {
        let (port, gchan) = self.shared.lookup(channum)?;
        locked(&port.channels[usize::from(gchan)]).stats = ChannelStats::default();
        Ok(())
    }

    /// Ring and restart state of a channel.
    pub fn chan_info(&self, channum: u32) -> Result<ChannelInfo, ChannelError> {
        let (port, gchan) = self.shared.lookup(channum)?;
        locked(&port.channels[usize::from(gchan)])
            .info()
            .ok_or(ChannelError::NoSuchChannel(channum))
    }

    /// Queues one frame for transmission.
    ///
    /// Frames that can never be sent are dropped and counted, not reported. A full ring
    /// returns [`XmitError::Busy`] with the frame; the user's `enable_xmit` is called once
    /// enough descriptors are free again.
    pub fn start_xmit(&self, channum: u32, token: MemToken) -> Result<(), XmitError> {
        let shared = &self.shared;
        let (port, gchan) = shared
            .lookup(channum)
            .map_err(|_| XmitError::NoSuchChannel(channum))?;
        let mut ch = locked(&port.channels[usize::from(gchan)]);
        if ch.state != ChannelState::Up {
            return Err(XmitError::ChannelDown(channum));
        }
        match ch.enqueue_tx(token, &shared.tx_pending)? {
            XmitOutcome::Queued => {
                if ch.ch_start_tx.is_some() {
                    shared.chan_restart(port.portnum, &mut ch);
                }
                Ok(())
            }
            XmitOutcome::Dropped => {
                shared.metrics.tx_dropped.inc();
                Ok(())
            }
            XmitOutcome::Busy(token) => {
                let user = ch.user.clone();
                drop(ch);
                if let Some(user) = user {
                    user.disable_xmit();
                }
                Err(XmitError::Busy(channum, token))
            }
        }
    }

    /// Reconfigures a port. Changing the line mode needs every channel of the port down.
    pub fn set_port(&self, portnum: u8, params: PortParams) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let port = shared.port(portnum)?;
        let mut state = locked(&port.state);
        if state.params.mode != params.mode && state.open_chans > 0 {
            return Err(ChannelError::PortBusy(portnum));
        }
        shared.framer.init_comet(portnum, &params)?;
        if state.params.loopback != params.loopback {
            shared.framer.set_loopback(portnum, params.loopback)?;
        }
        let pcd = params.pcd();
        port.write_reg(&mut state, PCD, pcd);
        state.params = params;
        Ok(())
    }

    /// Parameters of a port.
    pub fn get_port(&self, portnum: u8) -> Result<PortParams, ChannelError> {
        let port = self.shared.port(portnum)?;
        Ok(locked(&port.state).params.clone())
    }

    /// Sets the framer loopback of a port.
    pub fn loop_port(&self, portnum: u8, mode: LoopbackMode) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let port = shared.port(portnum)?;
        let mut state = locked(&port.state);
        shared.framer.set_loopback(portnum, mode)?;
        state.params.loopback = mode;
        Ok(())
    }

    /// Reads or writes a framer register of a port. Returns the value read or written.
    pub fn frame_rw(&self, portnum: u8, access: FramerAccess) -> Result<u8, ChannelError> {
        let shared = &self.shared;
        shared.port(portnum)?;
        match access.value {
            Some(value) => {
                shared.framer.write_reg(portnum, access.reg, value)?;
                Ok(value)
            }
            None => Ok(shared.framer.read_reg(portnum, access.reg)?),
        }
    }

    /// Summary of the card.
    pub fn get_info(&self) -> CardInfo {
        let shared = &self.shared;
        CardInfo {
            name: shared.config.name.clone(),
            state: self.state(),
            tx_pending: shared.tx_pending.load(Ordering::Acquire),
            iq_size: shared.iq.size(),
            iq_head: shared.iq.head(),
            iq_tail: shared.iq.tail(),
            intlog: shared.intlog.snapshot(),
            ports: shared
                .ports
                .iter()
                .map(|port| port.info(&locked(&port.state)))
                .collect(),
        }
    }

    /// Brings every channel down and stops the card's threads.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        let was_running = {
            let mut state = locked(&shared.state);
            std::mem::replace(&mut *state, CardState::Idle) == CardState::Running
        };
        if was_running {
            let channums: Vec<u32> = locked(&shared.channums).keys().copied().collect();
            for channum in channums {
                if let Err(err) = self.chan_down(channum) {
                    warn!(
                        "musycc: {}: channel {channum} down at shutdown: {err}",
                        shared.config.name
                    );
                }
            }
        }

        shared.stop.store(true, Ordering::Release);
        locked(&shared.restart_tx).take();
        locked(&shared.watchdog_tx).take();
        for evt in [&shared.irq, &shared.bh_evt] {
            if let Err(err) = evt.write(1) {
                warn!("musycc: {}: cannot wake thread: {err}", shared.config.name);
            }
        }
        let threads = std::mem::take(&mut *locked(&self.threads));
        for handle in threads {
            if handle.join().is_err() {
                error!("musycc: {}: a card thread panicked", shared.config.name);
            }
        }
        info!("musycc: {}: stopped", shared.config.name);
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        self.shutdown();
        CardMetricsPerDevice::remove(&self.shared.config.name, &self.shared.metrics);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::devices::musycc::test_utils::{Fixture, RecordingUser, test_config, wait_until};

    const WAIT: Duration = Duration::from_secs(5);

    fn idle_entry(channel: u8, lost: bool) -> IntrEntry {
        IntrEntry {
            direction: Direction::Rx,
            group: 0,
            channel,
            event: Event::ChannelIdle,
            error: ErrorCode::None,
            lost,
            len: 0,
        }
    }

    #[test]
    fn test_init_programs_queue() {
        let fx = Fixture::new();
        let writes = fx.emu.srd_writes();
        assert_eq!(
            writes.first(),
            Some(&(0, ServiceRequest::group(SrOp::ChipReset).to_raw()))
        );
        assert!(writes.contains(&(0, ServiceRequest::group(SrOp::GlobalInit).to_raw())));
        assert!(writes.contains(&(1, ServiceRequest::group(SrOp::GroupInit).to_raw())));
        assert_eq!(fx.card.state(), CardState::Running);
        assert_eq!(fx.emu.reg(IQP), fx.card.shared.iq.base());
        assert_eq!(fx.card.get_info().ports.len(), 2);
    }

    #[test]
    fn test_init_twice_fails() {
        let fx = Fixture::new();
        let err = fx.card.init().unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);
    }

    #[test]
    fn test_new_chan_errors() {
        let fx = Fixture::new();
        let user = RecordingUser::new();
        fx.card.new_chan(0, 3, user.clone()).unwrap();
        assert_eq!(
            fx.card.new_chan(0, 3, user.clone()).unwrap_err().errno(),
            libc::EEXIST
        );
        assert_eq!(
            fx.card.new_chan(9, 4, user.clone()).unwrap_err().errno(),
            libc::ENXIO
        );
        assert_eq!(
            fx.card
                .new_chan(0, MAX_CHANS_USED, user.clone())
                .unwrap_err()
                .errno(),
            libc::ECHRNG
        );
        assert_eq!(fx.card.chan_up(5).unwrap_err().errno(), libc::ENOENT);
    }

    #[test]
    fn test_port_full() {
        let fx = Fixture::new();
        let user = RecordingUser::new();
        for channum in 0..32 {
            fx.card.new_chan(1, channum, user.clone()).unwrap();
        }
        assert_eq!(
            fx.card.new_chan(1, 40, user.clone()).unwrap_err().errno(),
            libc::ENFILE
        );
        fx.card.del_chan(7).unwrap();
        fx.card.new_chan(1, 40, user).unwrap();
    }

    #[test]
    fn test_chan_up_programs_hardware() {
        let fx = Fixture::new();
        let user = RecordingUser::new();
        fx.card.new_chan(0, 3, user).unwrap();
        fx.card
            .set_chan(3, ChannelParams::with_timeslots(0x0F))
            .unwrap();
        fx.card.chan_up(3).unwrap();

        let info = fx.card.chan_info(3).unwrap();
        assert_eq!(info.state, ChannelState::Up);
        assert_eq!(info.txd_free, info.txd_num);
        assert_eq!(info.ch_start_tx, Some(RestartReason::FirstActivation));
        assert!(fx.emu.channel_active(0, info.gchan, Direction::Rx));
        assert!(!fx.emu.channel_active(0, info.gchan, Direction::Tx));
        assert_ne!(fx.emu.reg(chan_reg(0, RHP, info.gchan)), 0);
        assert_eq!(
            fx.emu.reg(tsm_reg(0, TTSM, 0)),
            tsm_entry(info.gchan, 0xFF)
        );
        assert_eq!(fx.card.chan_up(3).unwrap_err().errno(), libc::EBUSY);
        assert_eq!(fx.card.get_info().ports[0].open_chans, 1);
    }

    #[test]
    fn test_zero_timeslots() {
        let fx = Fixture::new();
        fx.card.new_chan(0, 1, RecordingUser::new()).unwrap();
        assert_eq!(fx.card.chan_up(1).unwrap_err().errno(), libc::ENOBUFS);
        assert_eq!(
            fx.card.chan_info(1).unwrap().state,
            ChannelState::Down
        );
    }

    #[test]
    fn test_set_chan_in_place() {
        let fx = Fixture::new();
        fx.card.new_chan(0, 1, RecordingUser::new()).unwrap();
        fx.card
            .set_chan(1, ChannelParams::with_timeslots(0x3))
            .unwrap();
        fx.card.chan_up(1).unwrap();
        let base = fx.emu.srd_writes().len();

        let mut params = fx.card.get_chan(1).unwrap();
        params.pad_fill_count = 2;
        fx.card.set_chan(1, params.clone()).unwrap();
        assert_eq!(fx.emu.srd_writes().len(), base);
        assert_eq!(fx.card.get_chan(1).unwrap(), params);

        params.set_timeslots(0x30);
        fx.card.set_chan(1, params).unwrap();
        assert!(fx.emu.srd_writes().len() > base);
        assert_eq!(fx.card.chan_info(1).unwrap().state, ChannelState::Up);
        assert_eq!(fx.emu.reg(tsm_reg(0, TTSM, 0)), 0);
    }

    #[test]
    fn test_set_port_busy() {
        let fx = Fixture::new();
        fx.card.new_chan(0, 1, RecordingUser::new()).unwrap();
        fx.card
            .set_chan(1, ChannelParams::with_timeslots(0x1))
            .unwrap();
        fx.card.chan_up(1).unwrap();

        let mut params = fx.card.get_port(0).unwrap();
        params.mode = crate::config::LineMode::T1Esf;
        assert_eq!(
            fx.card.set_port(0, params.clone()).unwrap_err().errno(),
            libc::EBUSY
        );
        fx.card.set_port(1, params.clone()).unwrap();
        assert_eq!(fx.card.get_port(1).unwrap(), params);
        assert_eq!(fx.emu.reg(group_reg(1, PCD)), params.pcd());
    }

    #[test]
    fn test_framer_passthrough() {
        let fx = Fixture::new();
        fx.card.loop_port(1, LoopbackMode::Local).unwrap();
        assert_eq!(fx.framer.loopback(1), Some(LoopbackMode::Local));
        assert_eq!(
            fx.card.get_port(1).unwrap().loopback,
            LoopbackMode::Local
        );

        let write = FramerAccess {
            reg: 0x10,
            value: Some(0x5A),
        };
        assert_eq!(fx.card.frame_rw(0, write).unwrap(), 0x5A);
        let read = FramerAccess {
            reg: 0x10,
            value: None,
        };
        assert_eq!(fx.card.frame_rw(0, read).unwrap(), 0x5A);
        assert_eq!(fx.card.frame_rw(5, read).unwrap_err().errno(), libc::ENXIO);
    }

    #[test]
    fn test_spurious_interrupt() {
        let fx = Fixture::new();
        let before = fx.card.get_info().intlog.top_half;
        fx.emu.raise_irq();
        assert!(wait_until(Duration::from_secs(5), || {
            fx.card.get_info().intlog.top_half > before
        }));
        assert!(fx.card.metrics().spurious_interrupts.count() >= 1);
    }

    #[test]
    fn test_shutdown_brings_channels_down() {
        let fx = Fixture::new();
        fx.card.new_chan(0, 1, RecordingUser::new()).unwrap();
        fx.card
            .set_chan(1, ChannelParams::with_timeslots(0x1))
            .unwrap();
        fx.card.chan_up(1).unwrap();
        fx.card.shutdown();
        assert_eq!(fx.card.chan_info(1).unwrap().state, ChannelState::Down);
        assert_eq!(fx.card.state(), CardState::Idle);
        assert_eq!(fx.card.chan_up(1).unwrap_err().errno(), libc::ENETDOWN);
        // A second call is a no-op.
        fx.card.shutdown();
    }

    #[test]
    fn test_empty_queue_entry_skipped() {
        let mut config = test_config();
        config.retry.iq_sentinel_polls = 2;
        let fx = Fixture::with_config(config);
        let metrics = fx.card.metrics().clone();

        fx.emu.post_raw(INT_EMPTY_ENTRY).unwrap();
        fx.emu.post_entry(idle_entry(5, false)).unwrap();
        assert!(wait_until(WAIT, || metrics.channel_idles.count() == 1));
        assert_eq!(metrics.iq_sentinel_skips.count(), 1);
        assert_eq!(metrics.iq_entries.count(), 1);
        let iq = &fx.card.shared.iq;
        assert!(wait_until(WAIT, || iq.head() == iq.tail()));
        assert_eq!(iq.head(), 2);
    }

    #[test]
    fn test_overflow_and_lost_entries_counted() {
        let fx = Fixture::new();
        let metrics = fx.card.metrics().clone();

        fx.emu.set_iq_overflow();
        fx.emu.post_entry(idle_entry(2, true)).unwrap();
        assert!(wait_until(WAIT, || metrics.channel_idles.count() == 1));
        assert_eq!(metrics.iq_overflows.count(), 1);
        assert_eq!(metrics.iq_lost_entries.count(), 1);

        fx.emu.post_entry(idle_entry(2, false)).unwrap();
        assert!(wait_until(WAIT, || metrics.channel_idles.count() == 2));
        assert_eq!(metrics.iq_overflows.count(), 1);
        assert_eq!(metrics.iq_lost_entries.count(), 1);
    }

    #[test]
    fn test_chan_down_waits_for_restart_in_flight() {
        let fx = Fixture::new();
        fx.card.new_chan(0, 4, RecordingUser::new()).unwrap();
        fx.card
            .set_chan(4, ChannelParams::with_timeslots(0x1))
            .unwrap();
        fx.card.chan_up(4).unwrap();
        let gchan = fx.card.chan_info(4).unwrap().gchan;
        let port = &fx.card.shared.ports[0];

        // An unacknowledged request keeps the group busy, so the restart worker stops between
        // its state check and its activation.
        fx.emu.set_suppress_ack(true);
        let busy = port.sr.submit(ServiceRequest::NOOP).unwrap();
        fx.emu
            .inject_error(0, gchan, Direction::Rx, ErrorCode::Buffer)
            .unwrap();
        assert!(wait_until(WAIT, || {
            fx.card.get_chan_stats(4).unwrap().rx_over_errors == 1
        }));
        assert!(wait_until(WAIT, || {
            fx.card.chan_info(4).unwrap().ch_start_rx.is_none()
        }));

        thread::scope(|scope| {
            let down = scope.spawn(|| fx.card.chan_down(4));
            thread::sleep(Duration::from_millis(50));
            assert_eq!(fx.card.chan_info(4).unwrap().state, ChannelState::Up);
            assert!(!down.is_finished());

            fx.emu.set_suppress_ack(false);
            drop(busy);
            down.join().unwrap().unwrap();
        });

        let info = fx.card.chan_info(4).unwrap();
        assert_eq!(info.state, ChannelState::Down);
        assert_eq!(info.rxd_num, 0);
        assert!(!fx.emu.channel_active(0, gchan, Direction::Rx));
        assert_eq!(fx.card.metrics().restarts_performed.count(), 1);
    }

    #[test]
    fn test_tx_restart_does_not_poll_queued_frame() {
        let mut config = test_config();
        config.retry.tx_owned_polls = u32::MAX;
        let fx = Fixture::with_config(config);
        fx.card.new_chan(1, 6, RecordingUser::new()).unwrap();
        fx.card
            .set_chan(6, ChannelParams::with_timeslots(0x3))
            .unwrap();
        fx.card.chan_up(6).unwrap();
        let gchan = fx.card.chan_info(6).unwrap().gchan;

        // The restart finds the new frame still device owned at the head of the ring.
        fx.card.start_xmit(6, fx.frame(&[b"queued"])).unwrap();
        assert!(wait_until(WAIT, || fx.emu.transmitted_frames(1, gchan).len() == 1));
        assert!(wait_until(WAIT, || {
            fx.card.chan_info(6).unwrap().ch_start_tx.is_none()
        }));
    }
}
