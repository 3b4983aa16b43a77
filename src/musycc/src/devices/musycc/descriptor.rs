// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Descriptor rings shared with the controller.
//!
//! Every descriptor is owned either by the host or by the device, as told by bit 31 of its
//! status word. The polarity differs per direction: a TX descriptor with the bit set belongs
//! to the device, an RX descriptor with the bit set belongs to the host. Only the owner may
//! change `status` or `data`.
//!
//! The host side of that contract is expressed with [`HostSlot`]: a slot is obtained through
//! [`DescriptorRing::claim_from_device`] once the device released it, and consumed by
//! [`DescriptorRing::release_to_device`]. The release is preceded by a release fence so the
//! device never sees the ownership flip before the rest of the descriptor.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use serde::Serialize;

use super::regs::{HOST_RX_OWNED, MUSYCC_TX_OWNED, SR_RX_DIRECTION, SR_TX_DIRECTION};
use crate::dma::{DmaError, DmaPool, DmaRegion, MemToken};

/// Bytes between two descriptors. The device only looks at the first 12.
pub const DESC_SIZE: u32 = 16;

const STATUS_OFFSET: u32 = 0;
const DATA_OFFSET: u32 = 4;
const NEXT_OFFSET: u32 = 8;

/// Direction of a half-duplex channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Device to host.
    Rx,
    /// Host to device.
    Tx,
}

impl Direction {
    /// Whether `status` says the device owns the descriptor.
    pub fn device_owns(self, status: u32) -> bool {
        match self {
            Direction::Tx => status & MUSYCC_TX_OWNED != 0,
            Direction::Rx => status & HOST_RX_OWNED == 0,
        }
    }

    /// `status` with ownership handed to the device.
    pub fn with_device_owner(self, status: u32) -> u32 {
        match self {
            Direction::Tx => status | MUSYCC_TX_OWNED,
            Direction::Rx => status & !HOST_RX_OWNED,
        }
    }

    /// `status` with ownership kept by the host.
    pub fn with_host_owner(self, status: u32) -> u32 {
        match self {
            Direction::Tx => status & !MUSYCC_TX_OWNED,
            Direction::Rx => status | HOST_RX_OWNED,
        }
    }

    /// Direction bit of a service request.
    pub fn sr_bits(self) -> u32 {
        match self {
            Direction::Tx => SR_TX_DIRECTION,
            Direction::Rx => SR_RX_DIRECTION,
        }
    }
}

/// Proof that the host owns descriptor `index`.
#[derive(Debug, PartialEq, Eq)]
pub struct HostSlot {
    index: u16,
}

impl HostSlot {
    /// Ring index of the descriptor.
    pub fn index(&self) -> u16 {
        self.index
    }
}

/// A circular descriptor ring plus the host-only shadow of each descriptor.
#[derive(Debug)]
pub struct DescriptorRing {
    direction: Direction,
    region: DmaRegion,
    len: u16,
    // Buffer handle attached to each descriptor, never visible to the device.
    tokens: Vec<Option<MemToken>>,
}

impl DescriptorRing {
    /// Allocates `len` linked descriptors, all owned by the host and without buffers.
    pub fn new(pool: &Arc<DmaPool>, direction: Direction, len: u16) -> Result<Self, DmaError> {
        let bytes = usize::from(len.max(1)) * DESC_SIZE as usize;
        let region = pool.allocate(bytes, u64::from(DESC_SIZE))?;
        let ring = DescriptorRing {
            direction,
            region,
            len,
            tokens: (0..len).map(|_| None).collect(),
        };
        let mem = ring.region.memory();
        for index in 0..len {
            let addr = ring.desc_addr(index);
            mem.write_u32(addr + DATA_OFFSET, 0)?;
            mem.write_u32(addr + NEXT_OFFSET, ring.desc_addr(ring.next_index(index)))?;
            mem.write_u32(addr + STATUS_OFFSET, direction.with_host_owner(0))?;
        }
        Ok(ring)
    }

    /// Direction served by the ring.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Number of descriptors.
    pub fn len(&self) -> u16 {
        self.len
    }

    /// Whether the ring has no descriptors.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the first descriptor.
    pub fn base(&self) -> u32 {
        self.region.addr()
    }

    /// Bus address of descriptor `index`.
    pub fn desc_addr(&self, index: u16) -> u32 {
        self.base() + u32::from(index) * DESC_SIZE
    }

    /// Index following `index`.
    pub fn next_index(&self, index: u16) -> u16 {
        if self.len == 0 {
            0
        } else {
            (index + 1) % self.len
        }
    }

    /// Index of the descriptor at bus address `addr`, if it belongs to the ring.
    pub fn index_of(&self, addr: u32) -> Option<u16> {
        let offset = addr.checked_sub(self.base())?;
        if offset % DESC_SIZE != 0 {
            return None;
        }
        u16::try_from(offset / DESC_SIZE)
            .ok()
            .filter(|index| *index < self.len)
    }

    /// Status word of descriptor `index`, loaded with acquire semantics.
    pub fn status(&self, index: u16) -> Result<u32, DmaError> {
        self.region
            .memory()
            .read_u32(self.desc_addr(index) + STATUS_OFFSET)
    }

    /// Data pointer of descriptor `index`.
    pub fn data(&self, index: u16) -> Result<u32, DmaError> {
        self.region
            .memory()
            .read_u32(self.desc_addr(index) + DATA_OFFSET)
    }

    /// Next pointer of descriptor `index`.
    pub fn next(&self, index: u16) -> Result<u32, DmaError> {
        self.region
            .memory()
            .read_u32(self.desc_addr(index) + NEXT_OFFSET)
    }

    /// Whether the device currently owns descriptor `index`.
    pub fn device_owns(&self, index: u16) -> Result<bool, DmaError> {
        Ok(self.direction.device_owns(self.status(index)?))
    }

    /// Whether descriptor `index` points at a buffer.
    pub fn has_buffer(&self, index: u16) -> Result<bool, DmaError> {
        Ok(self.data(index)? != 0)
    }

    /// Takes host ownership of descriptor `index` if the device released it.
    pub fn claim_from_device(&self, index: u16) -> Result<Option<HostSlot>, DmaError> {
        if index >= self.len || self.device_owns(index)? {
            return Ok(None);
        }
        Ok(Some(HostSlot { index }))
    }

    /// Fills a host-owned descriptor. `status` is stored with the host owner polarity.
    pub fn write(&self, slot: &HostSlot, data: u32, status: u32) -> Result<(), DmaError> {
        let addr = self.desc_addr(slot.index);
        let mem = self.region.memory();
        mem.write_u32(addr + DATA_OFFSET, data)?;
        mem.write_u32(
            addr + STATUS_OFFSET,
            self.direction.with_host_owner(status),
        )
    }

    /// Hands descriptor `slot` to the device.
    pub fn release_to_device(&self, slot: HostSlot) -> Result<(), DmaError> {
        // Everything written to the descriptor and its buffer must be visible before the
        // ownership flip.
        fence(Ordering::Release);
        let status = self.status(slot.index)?;
        self.region.memory().write_u32(
            self.desc_addr(slot.index) + STATUS_OFFSET,
            self.direction.with_device_owner(status),
        )
    }

    /// Attaches `token` to a host-owned descriptor, returning the previous one.
    pub fn replace_token(&mut self, slot: &HostSlot, token: Option<MemToken>) -> Option<MemToken> {
        std::mem::replace(&mut self.tokens[usize::from(slot.index)], token)
    }

    /// Detaches the token of a host-owned descriptor.
    pub fn take_token(&mut self, slot: &HostSlot) -> Option<MemToken> {
        self.tokens[usize::from(slot.index)].take()
    }

    /// Token attached to descriptor `index`.
    pub fn token(&self, index: u16) -> Option<&MemToken> {
        self.tokens.get(usize::from(index)).and_then(Option::as_ref)
    }

    /// Detaches every token. Only valid once the device stopped using the ring.
    pub fn drain_tokens(&mut self) -> Vec<MemToken> {
        self.tokens.iter_mut().filter_map(Option::take).collect()
    }

    /// Number of descriptors the device owns.
    pub fn device_owned_count(&self) -> Result<usize, DmaError> {
        let mut count = 0;
        for index in 0..self.len {
            if self.device_owns(index)? {
                count += 1;
            }
        }
        Ok(count)
    }
}
