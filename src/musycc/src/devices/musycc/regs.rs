// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Register map of the controller and bit layouts of its DMA structures.

use std::fmt::Debug;

/// 32-bit register window of the controller.
pub trait RegisterBus: Send + Sync + Debug {
    /// Reads the register at byte `offset`.
    fn read32(&self, offset: u64) -> u32;
    /// Writes the register at byte `offset`.
    fn write32(&self, offset: u64, value: u32);
}

/// Channels per port.
pub const MUSYCC_NCHANS: usize = 32;
/// Channel numbers accepted by `new_chan`.
pub const MAX_CHANS_USED: u32 = 128;

/// Distance between two group register blocks.
pub const GROUP_STRIDE: u64 = 0x800;

/// Per-channel TX head pointers.
pub const THP: u64 = 0x000;
/// Per-channel TX message pointers.
pub const TMP: u64 = 0x080;
/// Per-channel RX head pointers.
pub const RHP: u64 = 0x100;
/// Per-channel RX message pointers.
pub const RMP: u64 = 0x180;
/// TX timeslot map, one word per timeslot.
pub const TTSM: u64 = 0x200;
/// TX channel configuration table.
pub const TCCT: u64 = 0x380;
/// RX timeslot map.
pub const RTSM: u64 = 0x400;
/// RX channel configuration table.
pub const RCCT: u64 = 0x580;
/// Group base pointer.
pub const GBP: u64 = 0x600;
/// Dual address cycle base pointer.
pub const DACB: u64 = 0x604;
/// Service request descriptor.
pub const SRD: u64 = 0x608;
/// Interrupt status descriptor (group 0 only).
pub const ISD: u64 = 0x60C;
/// Interrupt queue pointer (group 0 only).
pub const IQP: u64 = 0x610;
/// Interrupt queue length minus one (group 0 only).
pub const IQL: u64 = 0x614;
/// Global configuration (group 0 only).
pub const GLOBAL_CONFIG: u64 = 0x618;
/// Group configuration.
pub const GRCD: u64 = 0x61C;
/// Port configuration.
pub const PCD: u64 = 0x620;
/// Maximum length of received messages.
pub const MLD: u64 = 0x624;

/// Byte offset of register `reg` of group `group`.
pub fn group_reg(group: u8, reg: u64) -> u64 {
    u64::from(group) * GROUP_STRIDE + reg
}

/// Byte offset of the per-channel word `gchan` of table `table` in group `group`.
pub fn chan_reg(group: u8, table: u64, gchan: u8) -> u64 {
    group_reg(group, table) + 4 * u64::from(gchan)
}

/// Byte offset of the timeslot map word `ts` of table `table` in group `group`.
pub fn tsm_reg(group: u8, table: u64, ts: usize) -> u64 {
    group_reg(group, table) + 4 * ts as u64
}

// Descriptor status word.
/// TX: the device owns the descriptor.
pub const MUSYCC_TX_OWNED: u32 = 0x8000_0000;
/// RX: the host owns the descriptor.
pub const HOST_RX_OWNED: u32 = 0x8000_0000;
/// Device stops polling after this descriptor.
pub const POLL_DISABLED: u32 = 0x4000_0000;
/// Interrupt on end of message.
pub const EOMIRQ_ENABLE: u32 = 0x2000_0000;
/// Interrupt on end of buffer.
pub const EOBIRQ_ENABLE: u32 = 0x1000_0000;
/// Append pad fill after the frame.
pub const PADFILL_ENABLE: u32 = 0x0100_0000;
/// Idle code field position.
pub const IDLE_CODE_SHIFT: u32 = 25;
/// Pad fill count position.
pub const PADFILL_SHIFT: u32 = 16;
/// Error code position in a completed RX descriptor.
pub const RX_ERROR_SHIFT: u32 = 16;
/// Error code mask in a completed RX descriptor, after shifting.
pub const RX_ERROR_MASK: u32 = 0xF;
/// Repeat the buffer.
pub const REPEAT_BIT: u32 = 0x0000_8000;
/// Buffer length.
pub const LENGTH_MASK: u32 = 0x3FFF;

// Interrupt queue entries.
/// Direction bit, set for TX.
pub const INTRPT_DIR_M: u32 = 0x8000_0000;
/// Low two bits of the group.
pub const INTRPT_GRP_M: u32 = 0x6000_0000;
/// Position of the low group bits.
pub const INTRPT_GRP_S: u32 = 29;
/// Third group bit.
pub const INTRPT_GRP_MSB_M: u32 = 0x0000_4000;
/// Shift moving the third group bit next to the low ones.
pub const INTRPT_GRP_MSB_S: u32 = 12;
/// Channel inside the group.
pub const INTRPT_CH_M: u32 = 0x1F00_0000;
/// Position of the channel.
pub const INTRPT_CH_S: u32 = 24;
/// Event code.
pub const INTRPT_EVENT_M: u32 = 0x00F0_0000;
/// Position of the event code.
pub const INTRPT_EVENT_S: u32 = 20;
/// Error code.
pub const INTRPT_ERROR_M: u32 = 0x000F_0000;
/// Position of the error code.
pub const INTRPT_ERROR_S: u32 = 16;
/// Entries were lost before this one.
pub const INTRPT_ILOST_M: u32 = 0x0000_8000;
/// Bytes in the buffer the entry refers to.
pub const INTRPT_BLEN_M: u32 = 0x0000_3FFF;

/// Marks an interrupt queue slot the host already consumed.
pub const INT_EMPTY_ENTRY: u32 = 0xFEED_FACE;
/// Alternate empty marker written by some firmware revisions.
pub const INT_EMPTY_ENTRY2: u32 = 0xDEAD_FACE;

// Interrupt status descriptor.
/// Index the device writes next.
pub const INTRPTS_NEXTINT_M: u32 = 0x7FFF_0000;
/// Position of the next index.
pub const INTRPTS_NEXTINT_S: u32 = 16;
/// The queue overflowed.
pub const INTRPTS_INTFULL_M: u32 = 0x0000_8000;
/// Entries written since the last acknowledgement.
pub const INTRPTS_INTCNT_M: u32 = 0x0000_7FFF;

// Service requests.
/// Acknowledge only.
pub const SR_NOOP: u32 = 0x0000;
/// Reset a group.
pub const SR_GROUP_RESET: u32 = 0x0100;
/// Load the global configuration and the interrupt queue.
pub const SR_GLOBAL_INIT: u32 = 0x0200;
/// Load a group configuration.
pub const SR_GROUP_INIT: u32 = 0x0300;
/// Reload a timeslot map.
pub const SR_TSM_UPDATE: u32 = 0x0400;
/// Start a channel direction.
pub const SR_CHANNEL_ACTIVATE: u32 = 0x0500;
/// Stop a channel direction.
pub const SR_CHANNEL_DEACTIVATE: u32 = 0x0600;
/// Reload a channel configuration word.
pub const SR_CHANNEL_CONFIG: u32 = 0x0B00;
/// Reset the chip.
pub const SR_CHIP_RESET: u32 = 0x1F00;
/// Operation field.
pub const SR_JOB_M: u32 = 0x1F00;
/// Request applies to TX.
pub const SR_TX_DIRECTION: u32 = 0x0020;
/// Request applies to RX.
pub const SR_RX_DIRECTION: u32 = 0x0000;
/// Channel inside the group.
pub const SR_GCHANNEL_M: u32 = 0x001F;

// Channel configuration words.
/// Position of the protocol field.
pub const CCT_PROTO_S: u32 = 2;
/// Invert the data.
pub const CCT_INVERT: u32 = 1 << 5;
/// Position of the interrupt mask bits.
pub const CCT_INTR_MASK_S: u32 = 8;
/// Position of the FIFO start.
pub const CCT_BUFFLOC_S: u32 = 16;
/// Position of the FIFO length.
pub const CCT_BUFFLEN_S: u32 = 24;

// Timeslot map words.
/// The timeslot is in use.
pub const TSM_ENABLE: u32 = 0x80;
/// Position of the subchannel bits.
pub const TSM_SUBCHAN_S: u32 = 8;

/// Builds a timeslot map word routing subchannel bits `mask` to `gchan`.
pub fn tsm_entry(gchan: u8, mask: u8) -> u32 {
    if mask == 0 {
        0
    } else {
        TSM_ENABLE | u32::from(gchan) | (u32::from(mask) << TSM_SUBCHAN_S)
    }
}
