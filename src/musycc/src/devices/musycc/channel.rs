// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channel state and the host side of its descriptor rings.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};

use super::descriptor::{DescriptorRing, Direction, HostSlot};
use super::interrupt::ErrorCode;
use super::port::FifoAlloc;
use super::regs::*;
use crate::config::{CardConfig, ChannelParams, MAX_BUFFER_LEN};
use crate::dma::{DmaError, DmaPool, MemToken};
use crate::logger::{debug, warn};

/// Callbacks into the user of a channel, typically a network interface.
///
/// Callbacks run on engine threads without any engine lock held, but must not call blocking
/// card operations such as `chan_up` or `chan_down`.
pub trait ChannelUser: Send + Sync + Debug {
    /// A frame of `len` bytes was received.
    fn recv_consume(&self, token: MemToken, len: usize);
    /// TX descriptors are available again after a `Busy` transmit.
    fn enable_xmit(&self) {}
    /// The TX ring is full.
    fn disable_xmit(&self) {}
    /// Whether the user stopped its transmit queue.
    fn queue_stopped(&self) -> bool {
        false
    }
    /// The port's line came up.
    fn line_is_up(&self) {}
    /// The port's line went down.
    fn line_is_down(&self) {}
}

/// Lifecycle state of a channel slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    /// Not bound to a channel number.
    Unassigned,
    /// Bound, rings not allocated.
    Down,
    /// Rings allocated, directions activated or about to be.
    Up,
}

/// Why a direction must be (re)activated by the restart worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RestartReason {
    /// The direction was never activated since the channel came up.
    FirstActivation,
    /// FIFO overrun or underrun.
    Overrun,
    /// Ring exhausted or TX underrun on a missing buffer.
    BufferError,
}

/// Per channel statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Frames delivered to the user.
    pub rx_packets: u64,
    /// Bytes delivered to the user.
    pub rx_bytes: u64,
    /// Receive errors without a more specific counter.
    pub rx_errors: u64,
    /// Good frames dropped for lack of a replacement buffer.
    pub rx_dropped: u64,
    /// Frames with a bad FCS.
    pub rx_crc_errors: u64,
    /// Frames aborted or misaligned.
    pub rx_missed_errors: u64,
    /// Frames too long or too short.
    pub rx_length_errors: u64,
    /// RX ring exhausted.
    pub rx_over_errors: u64,
    /// RX FIFO overruns.
    pub rx_fifo_errors: u64,
    /// Frames transmitted.
    pub tx_packets: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Frames dropped by `start_xmit`.
    pub tx_dropped: u64,
    /// TX underruns.
    pub tx_fifo_errors: u64,
    /// Channel aborts.
    pub tx_aborted_errors: u64,
}

/// Errors of channel and port operations.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ChannelError {
    /// Port {0} does not exist
    NoSuchPort(u8),
    /// Channel number {0} is out of range
    ChannelOutOfRange(u32),
    /// Channel {0} is already bound
    ChannelExists(u32),
    /// Port {0} has no free channel slot
    NoFreeSlot(u8),
    /// Channel {0} does not exist
    NoSuchChannel(u32),
    /// Channel {0} is already up
    AlreadyUp(u32),
    /// Timeslots of channel {0} overlap an active channel
    TimeslotOverlap(u32),
    /// Channel {0} has no timeslot
    NoTimeslots(u32),
    /// No FIFO space left on port {0}
    NoFifoSpace(u8),
    /// Port {0} has open channels
    PortBusy(u8),
    /// The card is not running
    NotRunning,
    /// DMA failure: {0}
    Dma(#[from] DmaError),
    /// Service request failure: {0}
    ServiceRequest(#[from] super::service::ServiceRequestError),
    /// Framer failure: {0}
    Framer(#[from] crate::devices::framer::FramerError),
}

impl ChannelError {
    /// Positive errno value matching the error.
    pub fn errno(&self) -> i32 {
        match self {
            ChannelError::NoSuchPort(_) => libc::ENXIO,
            ChannelError::ChannelOutOfRange(_) => libc::ECHRNG,
            ChannelError::ChannelExists(_) => libc::EEXIST,
            ChannelError::NoFreeSlot(_) => libc::ENFILE,
            ChannelError::NoSuchChannel(_) => libc::ENOENT,
            ChannelError::AlreadyUp(_) | ChannelError::PortBusy(_) => libc::EBUSY,
            ChannelError::TimeslotOverlap(_) => libc::EINVAL,
            ChannelError::NoTimeslots(_) | ChannelError::NoFifoSpace(_) => libc::ENOBUFS,
            ChannelError::NotRunning => libc::ENETDOWN,
            ChannelError::Dma(DmaError::Allocate(_)) => libc::ENOBUFS,
            ChannelError::Dma(_) | ChannelError::ServiceRequest(_) | ChannelError::Framer(_) => {
                libc::EIO
            }
        }
    }
}

/// Errors of `start_xmit`.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum XmitError {
    /// Channel {0} does not exist
    NoSuchChannel(u32),
    /// Channel {0} is not up
    ChannelDown(u32),
    /// TX ring of channel {0} is full
    Busy(u32, MemToken),
    /// DMA failure: {0}
    Dma(#[from] DmaError),
}

impl XmitError {
    /// Positive errno value matching the error.
    pub fn errno(&self) -> i32 {
        match self {
            XmitError::NoSuchChannel(_) => libc::ENOENT,
            XmitError::ChannelDown(_) => libc::ENETDOWN,
            XmitError::Busy(..) => libc::EBUSY,
            XmitError::Dma(_) => libc::EIO,
        }
    }

    /// Returns the frame of a `Busy` error so it can be retried.
    pub fn into_token(self) -> Option<MemToken> {
        match self {
            XmitError::Busy(_, token) => Some(token),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TxRing {
    pub ring: DescriptorRing,
    // Next descriptor to reclaim.
    pub irq_srv: u16,
    // Next descriptor to fill.
    pub usr_add: u16,
    pub free: u16,
    pub required: u16,
    pub full: bool,
}

#[derive(Debug)]
pub(crate) struct RxRing {
    pub ring: DescriptorRing,
    // Next descriptor to reclaim.
    pub irq_srv: u16,
    pub buf_size: usize,
}

#[derive(Debug)]
pub(crate) enum XmitOutcome {
    Queued,
    Dropped,
    Busy(MemToken),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TxReclaim {
    pub freed: u16,
    pub wake: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RxReclaim {
    pub delivered: Vec<(MemToken, usize)>,
    pub alloc_failures: u64,
}

/// Snapshot of a channel for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    /// Channel number.
    pub channum: u32,
    /// Channel inside the port.
    pub gchan: u8,
    /// State.
    pub state: ChannelState,
    /// TX ring length, 0 when down.
    pub txd_num: u16,
    /// Free TX descriptors.
    pub txd_free: u16,
    /// RX ring length, 0 when down.
    pub rxd_num: u16,
    /// Bytes queued for transmission.
    pub tx_pending: u64,
    /// Pending TX activation.
    pub ch_start_tx: Option<RestartReason>,
    /// Pending RX activation.
    pub ch_start_rx: Option<RestartReason>,
}

/// A channel slot of a port.
#[derive(Debug)]
pub struct Channel {
    pub(crate) gchan: u8,
    pub(crate) channum: Option<u32>,
    pub(crate) state: ChannelState,
    pub(crate) params: ChannelParams,
    pub(crate) user: Option<Arc<dyn ChannelUser>>,
    pub(crate) tx: Option<TxRing>,
    pub(crate) rx: Option<RxRing>,
    pub(crate) ch_start_rx: Option<RestartReason>,
    pub(crate) ch_start_tx: Option<RestartReason>,
    pub(crate) restart_queued: bool,
    // Bumped on every UP/DOWN transition so stale restart work is recognized.
    pub(crate) generation: u64,
    pub(crate) tx_pending: u64,
    pub(crate) fifo: Option<FifoAlloc>,
    pub(crate) stats: ChannelStats,
}

fn len_field(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(LENGTH_MASK) & LENGTH_MASK
}

fn rx_post_status(buf_size: usize, transparent: bool) -> u32 {
    let mut status = len_field(buf_size);
    if transparent {
        status |= EOBIRQ_ENABLE;
    }
    status
}

impl Channel {
    pub(crate) fn new(gchan: u8) -> Self {
        Channel {
            gchan,
            channum: None,
            state: ChannelState::Unassigned,
            params: ChannelParams::default(),
            user: None,
            tx: None,
            rx: None,
            ch_start_rx: None,
            ch_start_tx: None,
            restart_queued: false,
            generation: 0,
            tx_pending: 0,
            fifo: None,
            stats: ChannelStats::default(),
        }
    }

    pub(crate) fn info(&self) -> Option<ChannelInfo> {
        Some(ChannelInfo {
            channum: self.channum?,
            gchan: self.gchan,
            state: self.state,
            txd_num: self.tx.as_ref().map_or(0, |tx| tx.ring.len()),
            txd_free: self.tx.as_ref().map_or(0, |tx| tx.free),
            rxd_num: self.rx.as_ref().map_or(0, |rx| rx.ring.len()),
            tx_pending: self.tx_pending,
            ch_start_tx: self.ch_start_tx,
            ch_start_rx: self.ch_start_rx,
        })
    }

    /// Whether every TX descriptor is free.
    pub(crate) fn tx_idle(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.free == tx.ring.len())
    }

    /// Allocates both rings sized for the channel's timeslot count.
    pub(crate) fn alloc_rings(
        &mut self,
        pool: &Arc<DmaPool>,
        config: &CardConfig,
    ) -> Result<(), DmaError> {
        let nts = self.params.timeslot_count();
        let tx_len = config.tx_ring_len(nts);
        let rx_len = config.rx_ring_len(nts);
        let tx = DescriptorRing::new(pool, Direction::Tx, tx_len)?;
        let rx = DescriptorRing::new(pool, Direction::Rx, rx_len)?;
        self.tx = Some(TxRing {
            ring: tx,
            irq_srv: 0,
            usr_add: 0,
            free: tx_len,
            required: 0,
            full: false,
        });
        self.rx = Some(RxRing {
            ring: rx,
            irq_srv: 0,
            buf_size: config.max_mru,
        });
        Ok(())
    }

    /// Attaches a fresh buffer to every RX descriptor and hands them all to the device.
    pub(crate) fn post_rx_buffers(&mut self, pool: &Arc<DmaPool>) -> Result<(), DmaError> {
        let transparent = self.params.mode.is_transparent();
        let Some(rx) = self.rx.as_mut() else {
            return Ok(());
        };
        for index in 0..rx.ring.len() {
            let Some(slot) = rx.ring.claim_from_device(index)? else {
                continue;
            };
            let token = MemToken::alloc(pool, rx.buf_size)?;
            rx.ring.write(
                &slot,
                token.data_addr(),
                rx_post_status(rx.buf_size, transparent),
            )?;
            rx.ring.replace_token(&slot, Some(token));
            rx.ring.release_to_device(slot)?;
        }
        Ok(())
    }

    /// Releases both rings and every buffer they hold. The device must have stopped.
    pub(crate) fn teardown_rings(&mut self, card_pending: &AtomicU64) -> Vec<MemToken> {
        let mut tokens = Vec::new();
        if let Some(mut tx) = self.tx.take() {
            tokens.extend(tx.ring.drain_tokens());
        }
        if let Some(mut rx) = self.rx.take() {
            tokens.extend(rx.ring.drain_tokens());
        }
        card_pending.fetch_sub(self.tx_pending, Ordering::AcqRel);
        self.tx_pending = 0;
        tokens
    }

    /// Queues `token` on the TX ring.
    pub(crate) fn enqueue_tx(
        &mut self,
        token: MemToken,
        card_pending: &AtomicU64,
    ) -> Result<XmitOutcome, DmaError> {
        let Some(tx) = self.tx.as_mut() else {
            self.stats.tx_dropped += 1;
            return Ok(XmitOutcome::Dropped);
        };

        let segments: Vec<(u32, usize)> = token.dma_segments().collect();
        if segments.is_empty() {
            debug!("musycc: channel {:?} dropping empty frame", self.channum);
            self.stats.tx_dropped += 1;
            return Ok(XmitOutcome::Dropped);
        }
        if segments.iter().any(|(_, len)| *len > MAX_BUFFER_LEN) {
            warn!(
                "musycc: channel {:?} dropping frame with a segment over {MAX_BUFFER_LEN} bytes",
                self.channum
            );
            self.stats.tx_dropped += 1;
            return Ok(XmitOutcome::Dropped);
        }
        let needed = segments.len();
        if needed > usize::from(tx.ring.len()) {
            warn!(
                "musycc: channel {:?} frame needs {needed} descriptors, ring has {}",
                self.channum,
                tx.ring.len()
            );
            self.stats.tx_dropped += 1;
            return Ok(XmitOutcome::Dropped);
        }
        // `needed` fits in the ring length, hence in u16.
        let needed_u16 = u16::try_from(needed).unwrap_or(u16::MAX);
        if needed_u16 > tx.free {
            tx.full = true;
            tx.required = needed_u16;
            return Ok(XmitOutcome::Busy(token));
        }

        let mut slots: Vec<HostSlot> = Vec::with_capacity(needed);
        let mut index = tx.usr_add;
        for _ in 0..needed {
            match tx.ring.claim_from_device(index)? {
                Some(slot) => slots.push(slot),
                None => {
                    // Accounting says free but the device still holds it: treat as full.
                    tx.full = true;
                    tx.required = needed_u16;
                    return Ok(XmitOutcome::Busy(token));
                }
            }
            index = tx.ring.next_index(index);
        }

        let idle = self.params.idle_code.bits() << IDLE_CODE_SHIFT;
        let transparent = self.params.mode.is_transparent();
        let pad = u32::from(self.params.pad_fill_count);
        let last = needed - 1;
        for (n, (slot, (addr, len))) in slots.iter().zip(&segments).enumerate() {
            let mut status = len_field(*len) | idle;
            if transparent {
                status |= EOBIRQ_ENABLE;
            }
            if n == last {
                status |= EOMIRQ_ENABLE;
                if pad > 0 {
                    status |= PADFILL_ENABLE | (pad << PADFILL_SHIFT);
                }
            }
            tx.ring.write(slot, *addr, status)?;
        }

        let total = token.total_len() as u64;
        tx.ring.replace_token(&slots[last], Some(token));

        // The first descriptor goes to the device last, so it never starts on a partial frame.
        let mut slots = slots.into_iter();
        let first = slots.next();
        for slot in slots {
            tx.ring.release_to_device(slot)?;
        }
        if let Some(first) = first {
            tx.ring.release_to_device(first)?;
        }

        tx.usr_add = index;
        tx.free -= needed_u16;
        self.tx_pending += total;
        card_pending.fetch_add(total, Ordering::AcqRel);
        Ok(XmitOutcome::Queued)
    }

    /// Reclaims the TX descriptors the device is done with.
    pub(crate) fn reclaim_tx(
        &mut self,
        owned_polls: u32,
        card_pending: &AtomicU64,
    ) -> Result<TxReclaim, DmaError> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(TxReclaim::default());
        };

        let mut freed = 0;
        while tx.free < tx.ring.len() {
            let index = tx.irq_srv;
            if !tx.ring.has_buffer(index)? {
                break;
            }
            let slot = match tx.ring.claim_from_device(index)? {
                Some(slot) => slot,
                None if freed == 0 => {
                    // The completion entry may outrun the status write-back.
                    let mut claimed = None;
                    for _ in 0..owned_polls {
                        std::hint::spin_loop();
                        thread::yield_now();
                        claimed = tx.ring.claim_from_device(index)?;
                        if claimed.is_some() {
                            break;
                        }
                    }
                    match claimed {
                        Some(slot) => slot,
                        None => {
                            debug!(
                                "musycc: channel {:?} TX descriptor {index} still device owned",
                                self.channum
                            );
                            break;
                        }
                    }
                }
                None => break,
            };

            if let Some(token) = tx.ring.take_token(&slot) {
                let len = token.total_len() as u64;
                self.tx_pending = self.tx_pending.saturating_sub(len);
                card_pending.fetch_sub(len, Ordering::AcqRel);
                self.stats.tx_packets += 1;
                self.stats.tx_bytes += len;
            }
            tx.ring.write(&slot, 0, 0)?;
            tx.irq_srv = tx.ring.next_index(index);
            tx.free += 1;
            freed += 1;
        }

        let wake = tx.full && tx.free >= tx.required;
        if wake {
            tx.full = false;
        }
        Ok(TxReclaim { freed, wake })
    }

    /// Whether the descriptor the device resumes from holds a frame it owns.
    pub(crate) fn tx_ready_to_restart(&self) -> Result<bool, DmaError> {
        match self.tx.as_ref() {
            Some(tx) => Ok(tx.ring.has_buffer(tx.irq_srv)? && tx.ring.device_owns(tx.irq_srv)?),
            None => Ok(false),
        }
    }

    /// Bus address of the descriptor the device resumes from.
    pub(crate) fn tx_resume_addr(&self) -> u32 {
        self.tx
            .as_ref()
            .map_or(0, |tx| tx.ring.desc_addr(tx.irq_srv))
    }

    /// Reclaims every RX descriptor the device filled, in ring order.
    pub(crate) fn reclaim_rx(&mut self, pool: &Arc<DmaPool>) -> Result<RxReclaim, DmaError> {
        let transparent = self.params.mode.is_transparent();
        let mut result = RxReclaim::default();
        let Some(rx) = self.rx.as_mut() else {
            return Ok(result);
        };

        for _ in 0..rx.ring.len() {
            let index = rx.irq_srv;
            let Some(slot) = rx.ring.claim_from_device(index)? else {
                break;
            };
            let status = rx.ring.status(index)?;
            #[allow(clippy::cast_possible_truncation)]
            let error = ErrorCode::from(((status >> RX_ERROR_SHIFT) & RX_ERROR_MASK) as u8);
            let len = (status & LENGTH_MASK) as usize;

            match error {
                ErrorCode::None => match MemToken::alloc(pool, rx.buf_size) {
                    Ok(fresh) => {
                        if let Some(mut old) = rx.ring.replace_token(&slot, Some(fresh)) {
                            if old.set_len(len).is_ok() {
                                self.stats.rx_packets += 1;
                                self.stats.rx_bytes += len as u64;
                                result.delivered.push((old, len));
                            } else {
                                self.stats.rx_length_errors += 1;
                            }
                        }
                    }
                    Err(err) => {
                        // Keep the old buffer in the ring, the frame is lost.
                        debug!(
                            "musycc: channel {:?} no RX buffer, dropping frame: {err}",
                            self.channum
                        );
                        self.stats.rx_dropped += 1;
                        result.alloc_failures += 1;
                    }
                },
                ErrorCode::Fcs => self.stats.rx_crc_errors += 1,
                ErrorCode::Align | ErrorCode::Abort => self.stats.rx_missed_errors += 1,
                ErrorCode::Long | ErrorCode::Short => self.stats.rx_length_errors += 1,
                _ => self.stats.rx_errors += 1,
            }

            let data = rx.ring.token(index).map_or(0, MemToken::data_addr);
            rx.ring
                .write(&slot, data, rx_post_status(rx.buf_size, transparent))?;
            rx.ring.release_to_device(slot)?;
            rx.irq_srv = rx.ring.next_index(index);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::config::ChannelMode;
    use crate::dma::DmaMemory;

    const POOL_BASE: u64 = 0x20_0000;

    fn pool(size: u64) -> Arc<DmaPool> {
        let mem = DmaMemory::anonymous(POOL_BASE, 0x10_0000).unwrap();
        DmaPool::new(mem, POOL_BASE, size).unwrap()
    }

    fn up_channel(pool: &Arc<DmaPool>, txdesc_base: u16, rxdesc_base: u16) -> Channel {
        let config = CardConfig {
            txdesc_base,
            rxdesc_base,
            max_mru: 64,
            ..Default::default()
        };
        let mut ch = Channel::new(0);
        ch.channum = Some(7);
        ch.state = ChannelState::Up;
        ch.params = ChannelParams::with_timeslots(0x1);
        ch.alloc_rings(pool, &config).unwrap();
        ch.post_rx_buffers(pool).unwrap();
        ch
    }

    // Plays the device: completes the TX descriptor at `index`.
    fn complete_tx(pool: &Arc<DmaPool>, ch: &Channel, index: u16) {
        let ring = &ch.tx.as_ref().unwrap().ring;
        let status = ring.status(index).unwrap();
        assert_ne!(status & MUSYCC_TX_OWNED, 0);
        pool.memory()
            .write_u32(ring.desc_addr(index), status & !MUSYCC_TX_OWNED)
            .unwrap();
    }

    // Plays the device: fills the RX descriptor at `index`.
    fn fill_rx(pool: &Arc<DmaPool>, ch: &Channel, index: u16, data: &[u8], error: u32) {
        let ring = &ch.rx.as_ref().unwrap().ring;
        assert!(ring.device_owns(index).unwrap());
        let mem = pool.memory();
        mem.write_slice(ring.data(index).unwrap(), data).unwrap();
        let status = HOST_RX_OWNED | (error << RX_ERROR_SHIFT) | len_field(data.len());
        mem.write_u32(ring.desc_addr(index), status).unwrap();
    }

    #[test]
    fn test_enqueue_single_segment() {
        let pool = pool(0x8000);
        let pending = AtomicU64::new(0);
        let mut ch = up_channel(&pool, 4, 4);
        ch.params.pad_fill_count = 3;
        let token = MemToken::from_segments(&pool, &[b"hello"]).unwrap();
        let data = token.data_addr();

        assert!(matches!(
            ch.enqueue_tx(token, &pending).unwrap(),
            XmitOutcome::Queued
        ));
        let tx = ch.tx.as_ref().unwrap();
        let status = tx.ring.status(0).unwrap();
        assert_ne!(status & MUSYCC_TX_OWNED, 0);
        assert_ne!(status & EOMIRQ_ENABLE, 0);
        assert_ne!(status & PADFILL_ENABLE, 0);
        assert_eq!((status >> PADFILL_SHIFT) & 0xFF, 3);
        assert_eq!(status & LENGTH_MASK, 5);
        assert_eq!(tx.ring.data(0).unwrap(), data);
        assert_eq!(tx.usr_add, 1);
        assert_eq!(tx.free, 3);
        assert_eq!(ch.tx_pending, 5);
        assert_eq!(pending.load(Ordering::Acquire), 5);
    }

    #[test]
    fn test_enqueue_multi_segment_marks_last() {
        let pool = pool(0x8000);
        let pending = AtomicU64::new(0);
        let mut ch = up_channel(&pool, 4, 4);
        ch.params.mode = ChannelMode::Transparent;
        let token = MemToken::from_segments(&pool, &[b"ab", b"", b"cde"]).unwrap();
        ch.enqueue_tx(token, &pending).unwrap();

        let tx = ch.tx.as_ref().unwrap();
        let first = tx.ring.status(0).unwrap();
        let second = tx.ring.status(1).unwrap();
        assert_eq!(first & EOMIRQ_ENABLE, 0);
        assert_ne!(first & EOBIRQ_ENABLE, 0);
        assert_ne!(second & EOMIRQ_ENABLE, 0);
        assert!(tx.ring.token(0).is_none());
        assert!(tx.ring.token(1).is_some());
        assert_eq!(tx.free, 2);
    }

    #[test]
    fn test_enqueue_busy_then_reclaim_wakes() {
        let pool = pool(0x8000);
        let pending = AtomicU64::new(0);
        let mut ch = up_channel(&pool, 4, 4);
        let big = MemToken::from_segments(&pool, &[b"a", b"b", b"c"]).unwrap();
        ch.enqueue_tx(big, &pending).unwrap();

        let pair = MemToken::from_segments(&pool, &[b"d", b"e"]).unwrap();
        let XmitOutcome::Busy(pair) = ch.enqueue_tx(pair, &pending).unwrap() else {
            panic!("expected busy");
        };
        assert!(ch.tx.as_ref().unwrap().full);
        assert_eq!(ch.tx.as_ref().unwrap().required, 2);

        for index in 0..3 {
            complete_tx(&pool, &ch, index);
        }
        let reclaim = ch.reclaim_tx(0, &pending).unwrap();
        assert_eq!(
            reclaim,
            TxReclaim {
                freed: 3,
                wake: true
            }
        );
        assert_eq!(ch.stats.tx_packets, 1);
        assert_eq!(ch.stats.tx_bytes, 3);
        assert_eq!(pending.load(Ordering::Acquire), 0);
        assert!(matches!(
            ch.enqueue_tx(pair, &pending).unwrap(),
            XmitOutcome::Queued
        ));
    }

    #[test]
    fn test_enqueue_drops_unsendable() {
        let pool = pool(0x8000);
        let pending = AtomicU64::new(0);
        let mut ch = up_channel(&pool, 2, 2);
        let len = ch.tx.as_ref().unwrap().ring.len();

        let empty = MemToken::from_segments(&pool, &[b""]).unwrap();
        assert!(matches!(
            ch.enqueue_tx(empty, &pending).unwrap(),
            XmitOutcome::Dropped
        ));
        let parts: Vec<&[u8]> = (0..=len).map(|_| &b"x"[..]).collect();
        let huge = MemToken::from_segments(&pool, &parts).unwrap();
        assert!(matches!(
            ch.enqueue_tx(huge, &pending).unwrap(),
            XmitOutcome::Dropped
        ));
        assert_eq!(ch.stats.tx_dropped, 2);
        assert_eq!(ch.tx.as_ref().unwrap().free, len);
    }

    #[test]
    fn test_reclaim_stops_at_device_owned() {
        let pool = pool(0x8000);
        let pending = AtomicU64::new(0);
        let mut ch = up_channel(&pool, 4, 4);
        for _ in 0..2 {
            let token = MemToken::from_segments(&pool, &[b"xy"]).unwrap();
            ch.enqueue_tx(token, &pending).unwrap();
        }
        complete_tx(&pool, &ch, 0);

        let reclaim = ch.reclaim_tx(4, &pending).unwrap();
        assert_eq!(reclaim.freed, 1);
        assert!(!reclaim.wake);
        assert_eq!(ch.tx.as_ref().unwrap().irq_srv, 1);
        assert!(ch.tx_ready_to_restart().unwrap());
        assert_eq!(
            ch.tx_resume_addr(),
            ch.tx.as_ref().unwrap().ring.desc_addr(1)
        );
        assert_eq!(pending.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_reclaim_rx_delivers_in_order() {
        let pool = pool(0x8000);
        let mut ch = up_channel(&pool, 2, 4);
        fill_rx(&pool, &ch, 0, b"first", 0);
        fill_rx(&pool, &ch, 1, b"second", 0);
        fill_rx(&pool, &ch, 2, b"bad", u32::from(u8::from(ErrorCode::Fcs)));

        let result = ch.reclaim_rx(&pool).unwrap();
        let frames: Vec<Vec<u8>> = result
            .delivered
            .iter()
            .map(|(token, _)| token.to_vec().unwrap())
            .collect();
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(ch.stats.rx_packets, 2);
        assert_eq!(ch.stats.rx_crc_errors, 1);

        let rx = ch.rx.as_ref().unwrap();
        assert_eq!(rx.irq_srv, 3);
        for index in 0..rx.ring.len() {
            assert!(rx.ring.device_owns(index).unwrap());
            assert!(rx.ring.has_buffer(index).unwrap());
        }
    }

    #[test]
    fn test_reclaim_rx_alloc_failure_recycles() {
        let pool = pool(0x8000);
        let mut ch = up_channel(&pool, 1, 1);
        // Exhaust the pool so no replacement buffer can be allocated.
        let mut hogs = Vec::new();
        while let Ok(region) = pool.allocate(64, 16) {
            hogs.push(region);
        }
        let data = ch.rx.as_ref().unwrap().ring.data(0).unwrap();
        fill_rx(&pool, &ch, 0, b"lost", 0);

        let result = ch.reclaim_rx(&pool).unwrap();
        assert!(result.delivered.is_empty());
        assert_eq!(result.alloc_failures, 1);
        assert_eq!(ch.stats.rx_dropped, 1);
        let rx = ch.rx.as_ref().unwrap();
        assert_eq!(rx.ring.data(0).unwrap(), data);
        assert!(rx.ring.device_owns(0).unwrap());
    }

    #[test]
    fn test_teardown_returns_tokens() {
        let pool = pool(0x8000);
        let pending = AtomicU64::new(0);
        let mut ch = up_channel(&pool, 2, 2);
        let rx_len = usize::from(ch.rx.as_ref().unwrap().ring.len());
        let token = MemToken::from_segments(&pool, &[b"abc"]).unwrap();
        ch.enqueue_tx(token, &pending).unwrap();

        let tokens = ch.teardown_rings(&pending);
        assert_eq!(tokens.len(), rx_len + 1);
        assert!(ch.tx.is_none() && ch.rx.is_none());
        assert_eq!(ch.tx_pending, 0);
        assert_eq!(pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ChannelError::AlreadyUp(1).errno(), libc::EBUSY);
        assert_eq!(ChannelError::NoFifoSpace(0).errno(), libc::ENOBUFS);
        assert_eq!(ChannelError::ChannelOutOfRange(9).errno(), libc::ECHRNG);
        assert_eq!(XmitError::ChannelDown(1).errno(), libc::ENETDOWN);
    }

    #[derive(Clone, Debug)]
    enum TxStep {
        Send(usize),
        Complete,
        Reclaim,
    }

    fn tx_step() -> impl Strategy<Value = TxStep> {
        prop_oneof![
            (1usize..=3).prop_map(TxStep::Send),
            Just(TxStep::Complete),
            Just(TxStep::Reclaim),
        ]
    }

    proptest! {
        #[test]
        fn tx_descriptors_are_free_or_in_flight(
            steps in proptest::collection::vec(tx_step(), 1..80)
        ) {
            let pool = pool(0x2_0000);
            let pending = AtomicU64::new(0);
            let mut ch = up_channel(&pool, 4, 4);
            let len = usize::from(ch.tx.as_ref().unwrap().ring.len());
            // Sent by the device but not reclaimed yet.
            let mut done = 0u16;
            let mut device_next = 0u16;

            for step in steps {
                match step {
                    TxStep::Send(segments) => {
                        let parts: Vec<&[u8]> = (0..segments).map(|_| &b"frame"[..]).collect();
                        let token = MemToken::from_segments(&pool, &parts).unwrap();
                        let free = ch.tx.as_ref().unwrap().free;
                        match ch.enqueue_tx(token, &pending).unwrap() {
                            XmitOutcome::Queued => {
                                prop_assert_eq!(ch.tx.as_ref().unwrap().free, free - segments as u16);
                            }
                            XmitOutcome::Busy(_) => {
                                prop_assert!(usize::from(free) < segments);
                                prop_assert!(ch.tx.as_ref().unwrap().full);
                            }
                            XmitOutcome::Dropped => prop_assert!(false, "frame fits the ring"),
                        }
                    }
                    TxStep::Complete => {
                        let ring = &ch.tx.as_ref().unwrap().ring;
                        if ring.device_owns(device_next).unwrap() {
                            complete_tx(&pool, &ch, device_next);
                            device_next = ring.next_index(device_next);
                            done += 1;
                        }
                    }
                    TxStep::Reclaim => {
                        let reclaim = ch.reclaim_tx(0, &pending).unwrap();
                        prop_assert_eq!(reclaim.freed, done);
                        done = 0;
                    }
                }
                let tx = ch.tx.as_ref().unwrap();
                let owned = tx.ring.device_owned_count().unwrap();
                prop_assert_eq!(usize::from(tx.free) + owned + usize::from(done), len);
            }
        }
    }
}
