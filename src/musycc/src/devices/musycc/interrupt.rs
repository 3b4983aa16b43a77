// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interrupt queue entries and the host side of the circular interrupt queue.

use std::num::Wrapping;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::descriptor::Direction;
use super::regs::*;
use crate::dma::{DmaError, DmaPool, DmaRegion};

/// Event reported by an interrupt queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Event {
    /// No event, the entry only carries an error.
    None,
    /// Service request acknowledged.
    ServiceAck,
    /// End of buffer.
    EndOfBuffer,
    /// End of message.
    EndOfMessage,
    /// End of padfill.
    EndOfPadfill,
    /// Channel abort.
    ChannelAbort,
    /// Channel idle.
    ChannelIdle,
    /// Frame recovery.
    FrameRecovery,
    /// SS7 SUERM octet count increment.
    SuermIncrement,
    /// SS7 SUERM octet count decrement.
    SuermDecrement,
    /// SS7 filtered message.
    Ss7Filtered,
    /// Any code the engine does not know.
    Unknown(u8),
}

impl From<u8> for Event {
    fn from(code: u8) -> Self {
        match code {
            0 => Event::None,
            1 => Event::ServiceAck,
            2 => Event::EndOfBuffer,
            3 => Event::EndOfMessage,
            4 => Event::EndOfPadfill,
            5 => Event::ChannelAbort,
            6 => Event::ChannelIdle,
            7 => Event::FrameRecovery,
            8 => Event::SuermIncrement,
            9 => Event::SuermDecrement,
            10 => Event::Ss7Filtered,
            other => Event::Unknown(other),
        }
    }
}

impl From<Event> for u8 {
    fn from(event: Event) -> u8 {
        match event {
            Event::None => 0,
            Event::ServiceAck => 1,
            Event::EndOfBuffer => 2,
            Event::EndOfMessage => 3,
            Event::EndOfPadfill => 4,
            Event::ChannelAbort => 5,
            Event::ChannelIdle => 6,
            Event::FrameRecovery => 7,
            Event::SuermIncrement => 8,
            Event::SuermDecrement => 9,
            Event::Ss7Filtered => 10,
            Event::Unknown(code) => code,
        }
    }
}

/// Error reported by an interrupt queue entry or a completed RX descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    /// No error.
    None,
    /// Buffer error: TX underrun or RX ring exhausted.
    Buffer,
    /// Change of frame alignment.
    ChangeOfFrameAlignment,
    /// FIFO overrun (RX) or underrun (TX).
    Overrun,
    /// Protocol error.
    Protocol,
    /// Out of frame.
    OutOfFrame,
    /// Frame check sequence mismatch.
    Fcs,
    /// Octet alignment error.
    Align,
    /// Abort received.
    Abort,
    /// Frame longer than the buffer or the maximum length.
    Long,
    /// Frame shorter than allowed.
    Short,
    /// SS7 signal unit error rate monitor.
    SuErr,
    /// PCI parity error.
    Parity,
    /// Any code the engine does not know.
    Unknown(u8),
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        match code {
            0 => ErrorCode::None,
            1 => ErrorCode::Buffer,
            2 => ErrorCode::ChangeOfFrameAlignment,
            3 => ErrorCode::Overrun,
            4 => ErrorCode::Protocol,
            8 => ErrorCode::OutOfFrame,
            9 => ErrorCode::Fcs,
            10 => ErrorCode::Align,
            11 => ErrorCode::Abort,
            12 => ErrorCode::Long,
            13 => ErrorCode::Short,
            14 => ErrorCode::SuErr,
            15 => ErrorCode::Parity,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(error: ErrorCode) -> u8 {
        match error {
            ErrorCode::None => 0,
            ErrorCode::Buffer => 1,
            ErrorCode::ChangeOfFrameAlignment => 2,
            ErrorCode::Overrun => 3,
            ErrorCode::Protocol => 4,
            ErrorCode::OutOfFrame => 8,
            ErrorCode::Fcs => 9,
            ErrorCode::Align => 10,
            ErrorCode::Abort => 11,
            ErrorCode::Long => 12,
            ErrorCode::Short => 13,
            ErrorCode::SuErr => 14,
            ErrorCode::Parity => 15,
            ErrorCode::Unknown(code) => code,
        }
    }
}

/// Decoded interrupt queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntrEntry {
    /// Direction of the channel the entry is about.
    pub direction: Direction,
    /// Group (port) number, 0 to 7.
    pub group: u8,
    /// Channel inside the group, 0 to 31.
    pub channel: u8,
    /// Event.
    pub event: Event,
    /// Error.
    pub error: ErrorCode,
    /// The device dropped entries before this one.
    pub lost: bool,
    /// Buffer length for end of buffer and end of message events.
    pub len: u16,
}

impl IntrEntry {
    /// Decodes a raw queue word.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(raw: u32) -> Self {
        let direction = if raw & INTRPT_DIR_M != 0 {
            Direction::Tx
        } else {
            Direction::Rx
        };
        let group = ((raw & INTRPT_GRP_M) >> INTRPT_GRP_S)
            | ((raw & INTRPT_GRP_MSB_M) >> INTRPT_GRP_MSB_S);
        IntrEntry {
            direction,
            group: group as u8,
            channel: ((raw & INTRPT_CH_M) >> INTRPT_CH_S) as u8,
            event: Event::from(((raw & INTRPT_EVENT_M) >> INTRPT_EVENT_S) as u8),
            error: ErrorCode::from(((raw & INTRPT_ERROR_M) >> INTRPT_ERROR_S) as u8),
            lost: raw & INTRPT_ILOST_M != 0,
            len: (raw & INTRPT_BLEN_M) as u16,
        }
    }

    /// Encodes the entry the way the device writes it.
    pub fn encode(&self) -> u32 {
        let mut raw = 0;
        if self.direction == Direction::Tx {
            raw |= INTRPT_DIR_M;
        }
        let group = u32::from(self.group);
        raw |= (group << INTRPT_GRP_S) & INTRPT_GRP_M;
        raw |= (group << INTRPT_GRP_MSB_S) & INTRPT_GRP_MSB_M;
        raw |= (u32::from(self.channel) << INTRPT_CH_S) & INTRPT_CH_M;
        raw |= (u32::from(u8::from(self.event)) << INTRPT_EVENT_S) & INTRPT_EVENT_M;
        raw |= (u32::from(u8::from(self.error)) << INTRPT_ERROR_S) & INTRPT_ERROR_M;
        if self.lost {
            raw |= INTRPT_ILOST_M;
        }
        raw | (u32::from(self.len) & INTRPT_BLEN_M)
    }
}

/// Whether `raw` is one of the markers of a consumed queue slot.
pub fn is_empty_entry(raw: u32) -> bool {
    raw == INT_EMPTY_ENTRY || raw == INT_EMPTY_ENTRY2
}

/// Decoded interrupt status descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IsdStatus {
    /// Index the device writes next.
    pub next: u16,
    /// The queue overflowed.
    pub overflow: bool,
    /// Entries written since the last acknowledgement.
    pub count: u16,
}

impl IsdStatus {
    /// Decodes the register value.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(raw: u32) -> Self {
        IsdStatus {
            next: ((raw & INTRPTS_NEXTINT_M) >> INTRPTS_NEXTINT_S) as u16,
            overflow: raw & INTRPTS_INTFULL_M != 0,
            count: (raw & INTRPTS_INTCNT_M) as u16,
        }
    }

    /// Encodes the register value.
    pub fn encode(&self) -> u32 {
        let mut raw = (u32::from(self.next) << INTRPTS_NEXTINT_S) & INTRPTS_NEXTINT_M;
        if self.overflow {
            raw |= INTRPTS_INTFULL_M;
        }
        raw | (u32::from(self.count) & INTRPTS_INTCNT_M)
    }
}

/// Interrupt log kept for diagnostics.
#[derive(Debug, Default)]
pub struct IntLog {
    /// Last status descriptor read by the top half.
    pub last_isd: AtomicU32,
    /// Top half runs.
    pub top_half: AtomicU64,
    /// Bottom half runs.
    pub bottom_half: AtomicU64,
}

/// Snapshot of [`IntLog`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntLogSnapshot {
    /// Last status descriptor read by the top half.
    pub last_isd: u32,
    /// Top half runs.
    pub top_half: u64,
    /// Bottom half runs.
    pub bottom_half: u64,
}

impl IntLog {
    /// Current values.
    pub fn snapshot(&self) -> IntLogSnapshot {
        IntLogSnapshot {
            last_isd: self.last_isd.load(Ordering::Relaxed),
            top_half: self.top_half.load(Ordering::Relaxed),
            bottom_half: self.bottom_half.load(Ordering::Relaxed),
        }
    }
}

/// Host view of the circular interrupt queue.
///
/// The device appends at its own head, published through the status descriptor. The top half
/// only moves `tail` to that head; the bottom half only moves `head` toward `tail`, after the
/// entry at `head` has been dispatched and overwritten with [`INT_EMPTY_ENTRY`].
#[derive(Debug)]
pub struct InterruptQueue {
    region: DmaRegion,
    size: u32,
    head: AtomicU32,
    tail: AtomicU32,
    /// Serializes bottom half runs.
    pub(crate) bh_lock: Mutex<()>,
}

impl InterruptQueue {
    /// Allocates `size` entries, all marked empty.
    pub fn new(pool: &Arc<DmaPool>, size: u32) -> Result<Self, DmaError> {
        let region = pool.allocate(size as usize * 4, 4096)?;
        let queue = InterruptQueue {
            region,
            size,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            bh_lock: Mutex::new(()),
        };
        for index in 0..size {
            queue.recycle(index)?;
        }
        Ok(queue)
    }

    /// Bus address of entry 0.
    pub fn base(&self) -> u32 {
        self.region.addr()
    }

    /// Number of entries.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Next entry the bottom half dispatches.
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// One past the last entry the top half published.
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Publishes new entries up to `tail`, exclusive.
    pub fn set_tail(&self, tail: u32) {
        self.tail.store(tail % self.size, Ordering::Release);
    }

    /// Raw word of entry `index`.
    pub fn read(&self, index: u32) -> Result<u32, DmaError> {
        self.region.memory().read_u32(self.entry_addr(index))
    }

    /// Marks entry `index` consumed.
    pub fn recycle(&self, index: u32) -> Result<(), DmaError> {
        self.region
            .memory()
            .write_u32(self.entry_addr(index), INT_EMPTY_ENTRY)
    }

    /// Moves `head` past the dispatched entry.
    pub fn advance_head(&self) {
        let next = (Wrapping(self.head()) + Wrapping(1)).0 % self.size;
        self.head.store(next, Ordering::Release);
    }

    /// Entries published but not yet dispatched.
    pub fn pending(&self) -> u32 {
        (self.tail() + self.size - self.head()) % self.size
    }

    fn entry_addr(&self, index: u32) -> u32 {
        self.base() + (index % self.size) * 4
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::dma::DmaMemory;

    #[test]
    fn test_decode_layout() {
        // TX, group 2, channel 5, end of message, no error, 100 bytes.
        let raw = 0x8000_0000 | (2 << 29) | (5 << 24) | (3 << 20) | 100;
        let entry = IntrEntry::decode(raw);
        assert_eq!(entry.direction, Direction::Tx);
        assert_eq!(entry.group, 2);
        assert_eq!(entry.channel, 5);
        assert_eq!(entry.event, Event::EndOfMessage);
        assert_eq!(entry.error, ErrorCode::None);
        assert!(!entry.lost);
        assert_eq!(entry.len, 100);
        assert_eq!(entry.encode(), raw);
    }

    #[test]
    fn test_decode_group_msb() {
        // Bit 14 is the third bit of the group number.
        let raw = (1 << 29) | 0x4000 | (31 << 24) | (1 << 16) | 0x8000;
        let entry = IntrEntry::decode(raw);
        assert_eq!(entry.direction, Direction::Rx);
        assert_eq!(entry.group, 5);
        assert_eq!(entry.channel, 31);
        assert_eq!(entry.event, Event::None);
        assert_eq!(entry.error, ErrorCode::Buffer);
        assert!(entry.lost);
        assert_eq!(entry.len, 0);
    }

    #[test]
    fn test_codes() {
        assert_eq!(Event::from(1), Event::ServiceAck);
        assert_eq!(Event::from(10), Event::Ss7Filtered);
        assert_eq!(Event::from(13), Event::Unknown(13));
        assert_eq!(ErrorCode::from(3), ErrorCode::Overrun);
        assert_eq!(ErrorCode::from(9), ErrorCode::Fcs);
        assert_eq!(ErrorCode::from(5), ErrorCode::Unknown(5));
        for code in 0..16u8 {
            assert_eq!(u8::from(Event::from(code)), code);
            assert_eq!(u8::from(ErrorCode::from(code)), code);
        }
    }

    #[test]
    fn test_isd() {
        let isd = IsdStatus::decode(0x0123_8004);
        assert_eq!(isd.next, 0x123);
        assert!(isd.overflow);
        assert_eq!(isd.count, 4);
        assert_eq!(isd.encode(), 0x0123_8004);
    }

    #[test]
    fn test_sentinels() {
        assert!(is_empty_entry(0xFEED_FACE));
        assert!(is_empty_entry(0xDEAD_FACE));
        assert!(!is_empty_entry(0));
    }

    #[test]
    fn test_queue_indices() {
        let mem = DmaMemory::anonymous(0x1_0000, 0x1_0000).unwrap();
        let pool = DmaPool::new(mem, 0x1_0000, 0x1_0000).unwrap();
        let queue = InterruptQueue::new(&pool, 4).unwrap();
        assert!(is_empty_entry(queue.read(3).unwrap()));
        assert_eq!(queue.pending(), 0);

        queue.set_tail(3);
        assert_eq!(queue.pending(), 3);
        for _ in 0..3 {
            queue.advance_head();
        }
        assert_eq!(queue.head(), 3);
        queue.set_tail(5);
        assert_eq!(queue.tail(), 1);
        assert_eq!(queue.pending(), 2);
        queue.advance_head();
        assert_eq!(queue.head(), 0);
    }

    proptest! {
        #[test]
        fn decode_matches_fields(
            tx in any::<bool>(),
            group in 0u8..8,
            channel in 0u8..32,
            event in 0u8..16,
            error in 0u8..16,
            lost in any::<bool>(),
            len in 0u16..0x4000,
        ) {
            let entry = IntrEntry {
                direction: if tx { Direction::Tx } else { Direction::Rx },
                group,
                channel,
                event: Event::from(event),
                error: ErrorCode::from(error),
                lost,
                len,
            };
            prop_assert_eq!(IntrEntry::decode(entry.encode()), entry);
        }
    }
}
