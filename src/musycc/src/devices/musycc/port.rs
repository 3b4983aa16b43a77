// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A port: one group of 32 channels behind one framer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::channel::Channel;
use super::metrics::CardMetrics;
use super::regs::*;
use super::service::ServiceRequestEngine;
use crate::config::{ChannelParams, PortParams, RetryPolicy, TIMESLOTS};
use crate::devices::framer::Alarms;
use crate::logger::warn;

/// Units of on-chip FIFO space of a group.
pub const FIFO_SLOTS: usize = 32;

/// FIFO space held by a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FifoAlloc {
    /// First slot.
    pub start: u8,
    /// Number of slots.
    pub len: u8,
}

impl FifoAlloc {
    /// Slot indices covered by the allocation.
    pub fn slots(&self) -> std::ops::Range<usize> {
        usize::from(self.start)..usize::from(self.start) + usize::from(self.len)
    }
}

/// FIFO slots a channel asks for, from its timeslot count.
pub fn fifo_request(nts: usize) -> u8 {
    let slots = ((nts + 1) / 2).clamp(1, FIFO_SLOTS);
    u8::try_from(slots).unwrap_or(1)
}

/// Mutable state of a port, guarded by the port lock.
#[derive(Debug)]
pub(crate) struct PortState {
    pub params: PortParams,
    /// Owner of every FIFO slot.
    pub fifomap: [Option<u8>; FIFO_SLOTS],
    /// Union of the subchannel bits of every active channel.
    pub tsm: [u8; TIMESLOTS],
    /// Timeslot bitmask of every active channel.
    pub active: BTreeMap<u8, [u8; TIMESLOTS]>,
    pub open_chans: u32,
    /// Last value written to every group register.
    pub regram: BTreeMap<u64, u32>,
    /// Alarms seen by the last watchdog tick.
    pub alarms: Option<Alarms>,
}

impl PortState {
    fn new() -> Self {
        PortState {
            params: PortParams::default(),
            fifomap: [None; FIFO_SLOTS],
            tsm: [0; TIMESLOTS],
            active: BTreeMap::new(),
            open_chans: 0,
            regram: BTreeMap::new(),
            alarms: None,
        }
    }

    /// Reserves a contiguous run of up to `req` FIFO slots for `gchan`.
    ///
    /// The first free run long enough wins. Without one, the longest free run is used and the
    /// allocation shrinks. Returns `None` when no slot is free.
    pub fn fifo_alloc(&mut self, gchan: u8, req: u8) -> Option<FifoAlloc> {
        let req = usize::from(req).clamp(1, FIFO_SLOTS);
        let mut best: Option<(usize, usize)> = None;
        let mut index = 0;
        while index < FIFO_SLOTS {
            if self.fifomap[index].is_some() {
                index += 1;
                continue;
            }
            let start = index;
            while index < FIFO_SLOTS && self.fifomap[index].is_none() {
                index += 1;
            }
            let len = index - start;
            if len >= req {
                best = Some((start, req));
                break;
            }
            if best.is_none_or(|(_, best_len)| len > best_len) {
                best = Some((start, len));
            }
        }

        let (start, len) = best?;
        if len < req {
            warn!(
                "musycc: channel {gchan} gets {len} FIFO slots instead of {req}, bandwidth may \
                 suffer"
            );
        }
        for slot in &mut self.fifomap[start..start + len] {
            *slot = Some(gchan);
        }
        Some(FifoAlloc {
            start: u8::try_from(start).ok()?,
            len: u8::try_from(len).ok()?,
        })
    }

    /// Releases every FIFO slot owned by `gchan`.
    pub fn fifo_free(&mut self, gchan: u8) {
        for slot in self.fifomap.iter_mut() {
            if *slot == Some(gchan) {
                *slot = None;
            }
        }
    }

    /// Number of FIFO slots not owned by any channel.
    pub fn free_fifo_slots(&self) -> usize {
        self.fifomap.iter().filter(|slot| slot.is_none()).count()
    }

    /// Marks `gchan` active with `bitmask` and recomputes the timeslot map.
    pub fn activate_timeslots(&mut self, gchan: u8, bitmask: [u8; TIMESLOTS]) {
        self.active.insert(gchan, bitmask);
        self.recompute_tsm();
    }

    /// Removes `gchan` from the timeslot map.
    pub fn release_timeslots(&mut self, gchan: u8) {
        self.active.remove(&gchan);
        self.recompute_tsm();
    }

    /// Whether `params` uses a timeslot an active channel other than `gchan` holds.
    pub fn overlaps(&self, gchan: u8, params: &ChannelParams) -> bool {
        self.active
            .iter()
            .filter(|(owner, _)| **owner != gchan)
            .any(|(_, mask)| params.overlaps(mask))
    }

    fn recompute_tsm(&mut self) {
        self.tsm = [0; TIMESLOTS];
        for mask in self.active.values() {
            for (ts, bits) in mask.iter().enumerate() {
                self.tsm[ts] |= bits;
            }
        }
    }

    /// Hardware timeslot map entries, one owning channel per used timeslot.
    pub fn tsm_entries(&self) -> [u32; TIMESLOTS] {
        let mut entries = [0; TIMESLOTS];
        for (ts, entry) in entries.iter_mut().enumerate() {
            if let Some((gchan, mask)) = self.active.iter().find(|(_, mask)| mask[ts] != 0) {
                *entry = tsm_entry(*gchan, mask[ts]);
            }
        }
        entries
    }
}

/// Snapshot of a port for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Port number.
    pub portnum: u8,
    /// Port parameters.
    pub params: PortParams,
    /// Channels brought up.
    pub open_chans: u32,
    /// Unallocated FIFO slots.
    pub free_fifo_slots: usize,
    /// Whether the last alarm poll saw the line up, `None` before the first poll.
    pub line_up: Option<bool>,
}

/// A group of the controller.
#[derive(Debug)]
pub struct Port {
    pub(crate) portnum: u8,
    pub(crate) regs: Arc<dyn RegisterBus>,
    pub(crate) sr: ServiceRequestEngine,
    pub(crate) state: Mutex<PortState>,
    pub(crate) channels: Vec<Mutex<Channel>>,
    // Per channel, held by the restart worker from its state check until its activations are
    // acknowledged. Taken before the channel lock.
    pub(crate) restarts: Vec<Mutex<()>>,
}

impl Port {
    pub(crate) fn new(
        portnum: u8,
        regs: Arc<dyn RegisterBus>,
        policy: RetryPolicy,
        metrics: Arc<CardMetrics>,
    ) -> Self {
        let channels = (0..MUSYCC_NCHANS)
            .map(|gchan| Mutex::new(Channel::new(u8::try_from(gchan).unwrap_or(0))))
            .collect();
        Port {
            portnum,
            sr: ServiceRequestEngine::new(portnum, regs.clone(), policy, metrics),
            regs,
            state: Mutex::new(PortState::new()),
            channels,
            restarts: (0..MUSYCC_NCHANS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Writes a group register and records it in the shadow image.
    pub(crate) fn write_reg(&self, state: &mut PortState, reg: u64, value: u32) {
        state.regram.insert(reg, value);
        self.regs.write32(group_reg(self.portnum, reg), value);
    }

    /// Writes a per channel register and records it in the shadow image.
    pub(crate) fn write_chan_reg(&self, state: &mut PortState, table: u64, gchan: u8, value: u32) {
        let offset = chan_reg(0, table, gchan);
        state.regram.insert(offset, value);
        self.regs.write32(chan_reg(self.portnum, table, gchan), value);
    }

    /// Programs both timeslot maps from the port state.
    pub(crate) fn write_tsm(&self, state: &mut PortState) {
        for (ts, entry) in state.tsm_entries().into_iter().enumerate() {
            for table in [TTSM, RTSM] {
                let offset = tsm_reg(0, table, ts);
                state.regram.insert(offset, entry);
                self.regs.write32(tsm_reg(self.portnum, table, ts), entry);
            }
        }
    }

    pub(crate) fn info(&self, state: &PortState) -> PortInfo {
        PortInfo {
            portnum: self.portnum,
            params: state.params.clone(),
            open_chans: state.open_chans,
            free_fifo_slots: state.free_fifo_slots(),
            line_up: state.alarms.map(Alarms::line_is_up),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn owners(state: &PortState, gchan: u8) -> Vec<usize> {
        (0..FIFO_SLOTS)
            .filter(|slot| state.fifomap[*slot] == Some(gchan))
            .collect()
    }

    #[test]
    fn test_fifo_request() {
        assert_eq!(fifo_request(0), 1);
        assert_eq!(fifo_request(1), 1);
        assert_eq!(fifo_request(4), 2);
        assert_eq!(fifo_request(5), 3);
        assert_eq!(fifo_request(32), 16);
    }

    #[test]
    fn test_fifo_alloc_first_fit() {
        let mut state = PortState::new();
        let a = state.fifo_alloc(0, 4).unwrap();
        let b = state.fifo_alloc(1, 4).unwrap();
        assert_eq!(a, FifoAlloc { start: 0, len: 4 });
        assert_eq!(b, FifoAlloc { start: 4, len: 4 });

        state.fifo_free(0);
        assert!(owners(&state, 0).is_empty());
        let c = state.fifo_alloc(2, 2).unwrap();
        assert_eq!(c, FifoAlloc { start: 0, len: 2 });
        assert_eq!(owners(&state, 1), (4..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_fifo_alloc_shrinks() {
        let mut state = PortState::new();
        state.fifo_alloc(0, 30).unwrap();
        let shrunk = state.fifo_alloc(1, 4).unwrap();
        assert_eq!(shrunk, FifoAlloc { start: 30, len: 2 });
        assert_eq!(state.fifo_alloc(2, 1), None);
        assert_eq!(state.free_fifo_slots(), 0);
    }

    #[test]
    fn test_timeslot_map() {
        let mut state = PortState::new();
        let a = ChannelParams::with_timeslots(0x0F);
        let b = ChannelParams::with_timeslots(0x18);
        state.activate_timeslots(3, a.bitmask);
        assert!(state.overlaps(5, &b));
        assert!(!state.overlaps(3, &a));
        assert_eq!(state.tsm[0], 0xFF);
        assert_eq!(state.tsm[4], 0);

        let entries = state.tsm_entries();
        assert_eq!(entries[0], tsm_entry(3, 0xFF));
        assert_eq!(entries[4], 0);

        state.release_timeslots(3);
        assert_eq!(state.tsm, [0; TIMESLOTS]);
        assert!(!state.overlaps(5, &b));
    }

    #[test]
    fn test_subchannels_of_one_timeslot_rejected() {
        let mut state = PortState::new();
        let mut low = ChannelParams::default();
        low.bitmask[2] = 0x0F;
        let mut high = ChannelParams::default();
        high.bitmask[2] = 0xF0;
        state.activate_timeslots(1, low.bitmask);
        assert!(state.overlaps(2, &high));
        assert_eq!(state.tsm_entries()[2], tsm_entry(1, 0x0F));
    }

    proptest! {
        #[test]
        fn fifo_allocations_stay_disjoint(
            requests in proptest::collection::vec((0u8..32, 1u8..12, any::<bool>()), 1..64)
        ) {
            let mut state = PortState::new();
            let mut held: BTreeMap<u8, FifoAlloc> = BTreeMap::new();
            for (gchan, req, free) in requests {
                if free || held.contains_key(&gchan) {
                    state.fifo_free(gchan);
                    held.remove(&gchan);
                    continue;
                }
                if let Some(alloc) = state.fifo_alloc(gchan, req) {
                    prop_assert!(alloc.len >= 1 && alloc.len <= req);
                    held.insert(gchan, alloc);
                }
            }
            let mut seen = [false; FIFO_SLOTS];
            for (gchan, alloc) in &held {
                for slot in alloc.slots() {
                    prop_assert!(!seen[slot]);
                    prop_assert_eq!(state.fifomap[slot], Some(*gchan));
                    seen[slot] = true;
                }
            }
            let used = seen.iter().filter(|s| **s).count();
            prop_assert_eq!(used + state.free_fifo_slots(), FIFO_SLOTS);
        }

        #[test]
        fn active_timeslots_stay_disjoint(
            requests in proptest::collection::vec((0u8..32, any::<u32>(), any::<bool>()), 1..64)
        ) {
            let mut state = PortState::new();
            for (gchan, timeslots, release) in requests {
                if release {
                    state.release_timeslots(gchan);
                    continue;
                }
                let params = ChannelParams::with_timeslots(timeslots);
                if !state.overlaps(gchan, &params) {
                    state.activate_timeslots(gchan, params.bitmask);
                }
            }
            let mut union = [0u8; TIMESLOTS];
            let entries = state.tsm_entries();
            for (gchan, mask) in &state.active {
                for (ts, bits) in mask.iter().enumerate() {
                    if *bits != 0 {
                        prop_assert_eq!(union[ts], 0);
                        prop_assert_eq!(entries[ts], tsm_entry(*gchan, *bits));
                    }
                    union[ts] |= bits;
                }
            }
            prop_assert_eq!(union, state.tsm);
        }
    }
}
