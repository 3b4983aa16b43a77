// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Emulated controller and framers.
//!
//! [`EmulatedMusycc`] implements the register window on top of the same DMA memory the card
//! uses. Service requests are executed synchronously when written and acknowledged through the
//! interrupt queue, like the silicon does. TX descriptors are consumed when a channel is
//! activated and on [`EmulatedMusycc::run_dma`]; RX traffic is injected with
//! [`EmulatedMusycc::receive`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use vmm_sys_util::eventfd::EventFd;

use super::descriptor::Direction;
use super::interrupt::{ErrorCode, Event, IntrEntry, IsdStatus};
use super::locked;
use super::regs::*;
use super::service::{ServiceRequest, SrOp};
use crate::config::{LoopbackMode, PortParams};
use crate::devices::framer::{Alarms, Framer, FramerError};
use crate::dma::{DmaError, DmaMemory};
use crate::logger::{debug, warn};

// Upper bound on descriptors walked in one go, larger than any ring.
const MAX_WALK: usize = 256;

type ChanKey = (u8, u8);

#[derive(Debug, Default)]
struct EmulatorState {
    regs: BTreeMap<u64, u32>,
    srd_log: Vec<(u8, u32)>,
    corrupt_readback: bool,
    suppress_ack: bool,
    iq_base: u32,
    iq_len: u32,
    iq_next: u32,
    iq_count: u32,
    iq_overflow: bool,
    // Next descriptor of every active direction.
    tx: BTreeMap<ChanKey, u32>,
    rx: BTreeMap<ChanKey, u32>,
    // Where a stopped receiver resumes on its next activation.
    rx_stopped: BTreeMap<ChanKey, u32>,
    partial: BTreeMap<ChanKey, Vec<u8>>,
    frames: BTreeMap<ChanKey, Vec<Vec<u8>>>,
}

/// Software model of the controller.
#[derive(Debug)]
pub struct EmulatedMusycc {
    mem: DmaMemory,
    irq: EventFd,
    state: Mutex<EmulatorState>,
}

fn split(offset: u64) -> (u8, u64) {
    (
        u8::try_from(offset / GROUP_STRIDE).unwrap_or(u8::MAX),
        offset % GROUP_STRIDE,
    )
}

impl EmulatedMusycc {
    /// Creates a controller mastering `mem` and signalling `irq`.
    pub fn new(mem: DmaMemory, irq: EventFd) -> Self {
        EmulatedMusycc {
            mem,
            irq,
            state: Mutex::new(EmulatorState::default()),
        }
    }

    /// Every service request word written, with its group.
    pub fn srd_writes(&self) -> Vec<(u8, u32)> {
        locked(&self.state).srd_log.clone()
    }

    /// Makes service request readback differ from what was written.
    pub fn set_corrupt_readback(&self, corrupt: bool) {
        locked(&self.state).corrupt_readback = corrupt;
    }

    /// Stops acknowledging service requests.
    pub fn set_suppress_ack(&self, suppress: bool) {
        locked(&self.state).suppress_ack = suppress;
    }

    /// Reports an interrupt queue overflow on the next status read.
    pub fn set_iq_overflow(&self) {
        locked(&self.state).iq_overflow = true;
    }

    /// Last value written to register `offset`.
    pub fn reg(&self, offset: u64) -> u32 {
        locked(&self.state).regs.get(&offset).copied().unwrap_or(0)
    }

    /// Whether a channel direction is active.
    pub fn channel_active(&self, group: u8, gchan: u8, direction: Direction) -> bool {
        let state = locked(&self.state);
        match direction {
            Direction::Tx => state.tx.contains_key(&(group, gchan)),
            Direction::Rx => state.rx.contains_key(&(group, gchan)),
        }
    }

    /// Frames sent so far on a channel.
    pub fn transmitted_frames(&self, group: u8, gchan: u8) -> Vec<Vec<u8>> {
        locked(&self.state)
            .frames
            .get(&(group, gchan))
            .cloned()
            .unwrap_or_default()
    }

    /// Signals the interrupt line without queueing anything.
    pub fn raise_irq(&self) {
        if let Err(err) = self.irq.write(1) {
            warn!("musycc emulator: cannot raise interrupt: {err}");
        }
    }

    /// Appends a raw word to the interrupt queue.
    pub fn post_raw(&self, raw: u32) -> Result<(), DmaError> {
        let mut state = locked(&self.state);
        self.post_locked(&mut state, raw)
    }

    /// Appends an entry to the interrupt queue.
    pub fn post_entry(&self, entry: IntrEntry) -> Result<(), DmaError> {
        self.post_raw(entry.encode())
    }

    /// Walks the descriptors of every active TX channel.
    pub fn run_dma(&self) -> Result<(), DmaError> {
        let mut state = locked(&self.state);
        let active: Vec<ChanKey> = state.tx.keys().copied().collect();
        for (group, gchan) in active {
            self.transmit(&mut state, group, gchan)?;
        }
        Ok(())
    }

    /// Receives `data` on a channel, flagging the descriptor with `error`.
    ///
    /// Returns `false` when RX is inactive or the ring is exhausted. Exhaustion reports a
    /// buffer error and stops the direction, as the silicon does.
    pub fn receive(
        &self,
        group: u8,
        gchan: u8,
        data: &[u8],
        error: ErrorCode,
    ) -> Result<bool, DmaError> {
        let mut state = locked(&self.state);
        let key = (group, gchan);
        let Some(&desc) = state.rx.get(&key) else {
            return Ok(false);
        };

        let status = self.mem.read_u32(desc)?;
        if !Direction::Rx.device_owns(status) {
            state.rx.remove(&key);
            state.rx_stopped.insert(key, desc);
            let entry = Self::entry(group, gchan, Direction::Rx, Event::None, ErrorCode::Buffer, 0);
            self.post_locked(&mut state, entry)?;
            return Ok(false);
        }

        let buffer = self.mem.read_u32(desc + 4)?;
        let capacity = (status & LENGTH_MASK) as usize;
        let len = data.len().min(capacity);
        self.mem.write_slice(buffer, &data[..len])?;
        #[allow(clippy::cast_possible_truncation)]
        let len_field = len as u32 & LENGTH_MASK;
        let done = HOST_RX_OWNED | (u32::from(u8::from(error)) << RX_ERROR_SHIFT) | len_field;
        self.mem.write_u32(desc, done)?;
        let next = self.mem.read_u32(desc + 8)?;
        state.rx.insert(key, next);

        #[allow(clippy::cast_possible_truncation)]
        let entry = Self::entry(group, gchan, Direction::Rx, Event::EndOfMessage, error, len as u16);
        self.post_locked(&mut state, entry)?;
        Ok(true)
    }

    /// Reports `error` on a channel direction and stops it.
    pub fn inject_error(
        &self,
        group: u8,
        gchan: u8,
        direction: Direction,
        error: ErrorCode,
    ) -> Result<(), DmaError> {
        let mut state = locked(&self.state);
        let key = (group, gchan);
        match direction {
            Direction::Tx => {
                state.tx.remove(&key);
            }
            Direction::Rx => {
                if let Some(desc) = state.rx.remove(&key) {
                    state.rx_stopped.insert(key, desc);
                }
            }
        }
        let entry = Self::entry(group, gchan, direction, Event::None, error, 0);
        self.post_locked(&mut state, entry)
    }

    fn entry(
        group: u8,
        channel: u8,
        direction: Direction,
        event: Event,
        error: ErrorCode,
        len: u16,
    ) -> u32 {
        IntrEntry {
            direction,
            group,
            channel,
            event,
            error,
            lost: false,
            len,
        }
        .encode()
    }

    fn post_locked(&self, state: &mut EmulatorState, raw: u32) -> Result<(), DmaError> {
        if state.iq_len == 0 {
            debug!("musycc emulator: interrupt queue not loaded, dropping {raw:#x}");
            return Ok(());
        }
        self.mem
            .write_u32(state.iq_base + (state.iq_next % state.iq_len) * 4, raw)?;
        state.iq_next = (state.iq_next + 1) % state.iq_len;
        state.iq_count += 1;
        if state.iq_count > state.iq_len {
            state.iq_overflow = true;
        }
        self.raise_irq();
        Ok(())
    }

    fn transmit(&self, state: &mut EmulatorState, group: u8, gchan: u8) -> Result<(), DmaError> {
        let key = (group, gchan);
        let Some(&start) = state.tx.get(&key) else {
            return Ok(());
        };
        let mut desc = start;
        for _ in 0..MAX_WALK {
            let status = self.mem.read_u32(desc)?;
            if !Direction::Tx.device_owns(status) {
                break;
            }
            let buffer = self.mem.read_u32(desc + 4)?;
            let len = (status & LENGTH_MASK) as usize;
            let mut bytes = vec![0u8; len];
            self.mem.read_slice(buffer, &mut bytes)?;
            state.partial.entry(key).or_default().extend(bytes);

            // The descriptor goes back to the host before the completion is reported.
            self.mem.write_u32(desc, status & !MUSYCC_TX_OWNED)?;
            let event = if status & EOMIRQ_ENABLE != 0 {
                let frame = state.partial.remove(&key).unwrap_or_default();
                state.frames.entry(key).or_default().push(frame);
                Some(Event::EndOfMessage)
            } else if status & EOBIRQ_ENABLE != 0 {
                Some(Event::EndOfBuffer)
            } else {
                None
            };
            if let Some(event) = event {
                #[allow(clippy::cast_possible_truncation)]
                let entry =
                    Self::entry(group, gchan, Direction::Tx, event, ErrorCode::None, len as u16);
                self.post_locked(state, entry)?;
            }
            desc = self.mem.read_u32(desc + 8)?;
        }
        state.tx.insert(key, desc);
        Ok(())
    }

    fn service_request(&self, state: &mut EmulatorState, group: u8, raw: u32) {
        let Some(req) = ServiceRequest::from_raw(raw) else {
            warn!("musycc emulator: unknown service request {raw:#x}");
            return;
        };
        let key = (group, req.gchan);
        match req.op {
            SrOp::ChipReset => {
                let log = std::mem::take(&mut state.srd_log);
                let corrupt = state.corrupt_readback;
                let suppress = state.suppress_ack;
                *state = EmulatorState {
                    srd_log: log,
                    corrupt_readback: corrupt,
                    suppress_ack: suppress,
                    ..Default::default()
                };
                return;
            }
            SrOp::GlobalInit => {
                state.iq_base = state.regs.get(&IQP).copied().unwrap_or(0);
                state.iq_len = state.regs.get(&IQL).copied().unwrap_or(0) + 1;
                state.iq_next = 0;
                state.iq_count = 0;
                state.iq_overflow = false;
            }
            SrOp::ChannelActivate => {
                let table = match req.direction {
                    Direction::Tx => THP,
                    Direction::Rx => RHP,
                };
                let head = state
                    .regs
                    .get(&chan_reg(group, table, req.gchan))
                    .copied()
                    .unwrap_or(0);
                match req.direction {
                    Direction::Tx => state.tx.insert(key, head),
                    Direction::Rx => {
                        let head = state.rx_stopped.remove(&key).unwrap_or(head);
                        state.rx.insert(key, head)
                    }
                };
            }
            SrOp::ChannelDeactivate => {
                match req.direction {
                    Direction::Tx => {
                        state.tx.remove(&key);
                        state.partial.remove(&key);
                    }
                    Direction::Rx => {
                        state.rx.remove(&key);
                        state.rx_stopped.remove(&key);
                    }
                };
            }
            SrOp::GroupReset => {
                state.tx.retain(|(g, _), _| *g != group);
                state.rx.retain(|(g, _), _| *g != group);
                state.rx_stopped.retain(|(g, _), _| *g != group);
            }
            SrOp::Noop | SrOp::GroupInit | SrOp::TsmUpdate | SrOp::ChannelConfig => {}
        }

        if !state.suppress_ack {
            let ack = Self::entry(group, req.gchan, req.direction, Event::ServiceAck, ErrorCode::None, 0);
            if let Err(err) = self.post_locked(state, ack) {
                warn!("musycc emulator: cannot acknowledge {raw:#x}: {err}");
            }
        }
        if req.op == SrOp::ChannelActivate && req.direction == Direction::Tx {
            if let Err(err) = self.transmit(state, group, req.gchan) {
                warn!("musycc emulator: transmit failed: {err}");
            }
        }
    }
}

impl RegisterBus for EmulatedMusycc {
    fn read32(&self, offset: u64) -> u32 {
        let state = locked(&self.state);
        if offset == ISD {
            #[allow(clippy::cast_possible_truncation)]
            return IsdStatus {
                next: state.iq_next as u16,
                overflow: state.iq_overflow,
                count: state.iq_count.min(INTRPTS_INTCNT_M) as u16,
            }
            .encode();
        }
        state.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u64, value: u32) {
        let mut state = locked(&self.state);
        let (group, reg) = split(offset);
        match reg {
            SRD => {
                state.srd_log.push((group, value));
                if state.corrupt_readback {
                    state.regs.insert(offset, !value);
                    return;
                }
                state.regs.insert(offset, value);
                self.service_request(&mut state, group, value);
            }
            ISD if group == 0 => {
                let acked = u32::from(IsdStatus::decode(value).count);
                state.iq_count = state.iq_count.saturating_sub(acked);
                state.iq_overflow = false;
                if state.iq_count > 0 {
                    self.raise_irq();
                }
            }
            _ => {
                state.regs.insert(offset, value);
            }
        }
    }
}

#[derive(Debug, Default)]
struct FramerState {
    alarms: BTreeMap<u8, Alarms>,
    loopback: BTreeMap<u8, LoopbackMode>,
    regs: BTreeMap<(u8, u16), u8>,
    initialized: BTreeSet<u8>,
}

/// Framers with settable alarms and a flat register file.
#[derive(Debug)]
pub struct EmulatedFramer {
    ports: u8,
    state: Mutex<FramerState>,
}

/// Registers of an emulated framer.
pub const FRAMER_REGS: u16 = 0x200;

impl EmulatedFramer {
    /// Creates framers for `ports` ports, every line up.
    pub fn new(ports: u8) -> Self {
        EmulatedFramer {
            ports,
            state: Mutex::new(FramerState::default()),
        }
    }

    /// Sets the alarms `port` reports from now on.
    pub fn set_alarms(&self, port: u8, alarms: Alarms) {
        locked(&self.state).alarms.insert(port, alarms);
    }

    /// Loopback last set on `port`.
    pub fn loopback(&self, port: u8) -> Option<LoopbackMode> {
        locked(&self.state).loopback.get(&port).copied()
    }

    /// Whether `init_comet` ran for `port`.
    pub fn initialized(&self, port: u8) -> bool {
        locked(&self.state).initialized.contains(&port)
    }

    fn check(&self, port: u8) -> Result<(), FramerError> {
        if port >= self.ports {
            return Err(FramerError::NoFramer(port));
        }
        Ok(())
    }
}

impl Framer for EmulatedFramer {
    fn init_comet(&self, port: u8, params: &PortParams) -> Result<(), FramerError> {
        self.check(port)?;
        let mut state = locked(&self.state);
        state.initialized.insert(port);
        state.loopback.insert(port, params.loopback);
        Ok(())
    }

    fn alarms(&self, port: u8) -> Result<Alarms, FramerError> {
        self.check(port)?;
        Ok(locked(&self.state)
            .alarms
            .get(&port)
            .copied()
            .unwrap_or_default())
    }

    fn set_loopback(&self, port: u8, mode: LoopbackMode) -> Result<(), FramerError> {
        self.check(port)?;
        locked(&self.state).loopback.insert(port, mode);
        Ok(())
    }

    fn read_reg(&self, port: u8, reg: u16) -> Result<u8, FramerError> {
        self.check(port)?;
        if reg >= FRAMER_REGS {
            return Err(FramerError::BadRegister(reg));
        }
        Ok(locked(&self.state)
            .regs
            .get(&(port, reg))
            .copied()
            .unwrap_or(0))
    }

    fn write_reg(&self, port: u8, reg: u16, value: u8) -> Result<(), FramerError> {
        self.check(port)?;
        if reg >= FRAMER_REGS {
            return Err(FramerError::BadRegister(reg));
        }
        locked(&self.state).regs.insert((port, reg), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x10_0000;

    fn emulator() -> (EmulatedMusycc, DmaMemory, EventFd) {
        let mem = DmaMemory::anonymous(BASE, 0x1_0000).unwrap();
        let irq = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let emu = EmulatedMusycc::new(mem.clone(), irq.try_clone().unwrap());
        (emu, mem, irq)
    }

    fn load_queue(emu: &EmulatedMusycc, len: u32) {
        emu.write32(IQP, BASE as u32);
        emu.write32(IQL, len - 1);
        emu.write32(SRD, ServiceRequest::group(SrOp::GlobalInit).to_raw());
    }

    #[test]
    fn test_service_request_acknowledged() {
        let (emu, mem, irq) = emulator();
        load_queue(&emu, 8);
        let isd = IsdStatus::decode(emu.read32(ISD));
        assert_eq!(isd.count, 1);
        assert_eq!(isd.next, 1);
        let entry = IntrEntry::decode(mem.read_u32(BASE as u32).unwrap());
        assert_eq!(entry.event, Event::ServiceAck);
        assert_eq!(irq.read().unwrap(), 1);

        emu.write32(ISD, isd.encode());
        assert_eq!(IsdStatus::decode(emu.read32(ISD)).count, 0);
    }

    #[test]
    fn test_corrupt_readback_is_not_executed() {
        let (emu, _mem, _irq) = emulator();
        load_queue(&emu, 8);
        emu.set_corrupt_readback(true);
        let raw = ServiceRequest::new(SrOp::ChannelActivate, Direction::Rx, 2).to_raw();
        emu.write32(SRD, raw);
        assert_ne!(emu.read32(SRD), raw);
        assert!(!emu.channel_active(0, 2, Direction::Rx));
        assert_eq!(emu.srd_writes().last(), Some(&(0, raw)));
    }

    #[test]
    fn test_chip_reset_forgets_queue() {
        let (emu, _mem, _irq) = emulator();
        load_queue(&emu, 8);
        emu.write32(SRD, ServiceRequest::group(SrOp::ChipReset).to_raw());
        assert_eq!(IsdStatus::decode(emu.read32(ISD)).count, 0);
        assert_eq!(emu.srd_writes().len(), 2);
    }

    #[test]
    fn test_framer_registers() {
        let framer = EmulatedFramer::new(2);
        framer.write_reg(1, 0x20, 7).unwrap();
        assert_eq!(framer.read_reg(1, 0x20).unwrap(), 7);
        assert_eq!(framer.read_reg(0, 0x20).unwrap(), 0);
        assert_eq!(
            framer.read_reg(2, 0).unwrap_err(),
            FramerError::NoFramer(2)
        );
        assert_eq!(
            framer.write_reg(0, FRAMER_REGS, 1).unwrap_err(),
            FramerError::BadRegister(FRAMER_REGS)
        );
        framer.set_alarms(0, Alarms::AIS);
        assert_eq!(framer.alarms(0).unwrap(), Alarms::AIS);
        assert_eq!(framer.alarms(1).unwrap(), Alarms::empty());
    }
}
