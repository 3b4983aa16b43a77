// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channel parameters.

use serde::{Deserialize, Serialize};

/// Timeslots in a port's frame.
pub const TIMESLOTS: usize = 32;

/// Framing protocol of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ChannelMode {
    /// Raw bit stream, buffers are returned on every end of buffer.
    Transparent,
    /// SS7 signalling units.
    Ss7,
    /// HDLC with a 16-bit frame check sequence.
    #[default]
    Hdlc16,
    /// HDLC with a 32-bit frame check sequence.
    Hdlc32,
}

impl ChannelMode {
    /// Protocol field of the channel configuration word.
    pub fn protocol_code(self) -> u32 {
        match self {
            ChannelMode::Transparent => 0,
            ChannelMode::Ss7 => 1,
            ChannelMode::Hdlc16 => 2,
            ChannelMode::Hdlc32 => 3,
        }
    }

    /// Whether buffers complete on end of buffer rather than end of message.
    pub fn is_transparent(self) -> bool {
        self == ChannelMode::Transparent
    }
}

/// Pattern sent between TX frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum IdleCode {
    /// HDLC flags (0x7E).
    #[default]
    Flags,
    /// All ones.
    Ones,
    /// All zeros.
    Zeros,
}

impl IdleCode {
    /// Two-bit idle code field of a TX descriptor.
    pub fn bits(self) -> u32 {
        match self {
            IdleCode::Flags => 0,
            IdleCode::Ones => 1,
            IdleCode::Zeros => 2,
        }
    }
}

fn enabled() -> bool {
    true
}

/// Configuration of a single channel.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelParams {
    /// Framing protocol.
    #[serde(default)]
    pub mode: ChannelMode,
    /// TX idle pattern.
    #[serde(default)]
    pub idle_code: IdleCode,
    /// Idle codes inserted after every TX frame.
    #[serde(default)]
    pub pad_fill_count: u8,
    /// Invert received data.
    #[serde(default)]
    pub inv_rx: bool,
    /// Invert transmitted data.
    #[serde(default)]
    pub inv_tx: bool,
    /// Interrupt mask bits of the channel configuration word.
    #[serde(default)]
    pub intr_mask: u8,
    /// Receive direction enabled.
    #[serde(default = "enabled")]
    pub rx_enabled: bool,
    /// Transmit direction enabled.
    #[serde(default = "enabled")]
    pub tx_enabled: bool,
    /// Subchannel bits used in every timeslot, zero when the timeslot is unused.
    #[serde(default)]
    pub bitmask: [u8; TIMESLOTS],
}

impl Default for ChannelParams {
    fn default() -> Self {
        ChannelParams {
            mode: ChannelMode::default(),
            idle_code: IdleCode::default(),
            pad_fill_count: 0,
            inv_rx: false,
            inv_tx: false,
            intr_mask: 0,
            rx_enabled: true,
            tx_enabled: true,
            bitmask: [0; TIMESLOTS],
        }
    }
}

impl ChannelParams {
    /// Parameters using every bit of the timeslots set in `timeslots`.
    pub fn with_timeslots(timeslots: u32) -> Self {
        let mut params = ChannelParams::default();
        params.set_timeslots(timeslots);
        params
    }

    /// Uses every bit of the timeslots set in `timeslots` and nothing else.
    pub fn set_timeslots(&mut self, timeslots: u32) {
        for (ts, mask) in self.bitmask.iter_mut().enumerate() {
            *mask = if timeslots & (1 << ts) != 0 { 0xFF } else { 0 };
        }
    }

    /// Number of timeslots carrying at least one bit of the channel.
    pub fn timeslot_count(&self) -> usize {
        self.bitmask.iter().filter(|m| **m != 0).count()
    }

    /// Whether a timeslot the channel uses also carries bits of `tsm`.
    ///
    /// A timeslot map entry names a single channel, so subchannels of different channels
    /// cannot share a timeslot.
    pub fn overlaps(&self, tsm: &[u8; TIMESLOTS]) -> bool {
        self.bitmask.iter().zip(tsm).any(|(a, b)| *a != 0 && *b != 0)
    }

    /// Whether moving from `self` to `new` requires a DOWN/UP cycle of a running channel.
    pub fn needs_restart(&self, new: &ChannelParams) -> bool {
        self.mode != new.mode
            || self.inv_rx != new.inv_rx
            || self.inv_tx != new.inv_tx
            || self.intr_mask != new.intr_mask
            || self.rx_enabled != new.rx_enabled
            || self.tx_enabled != new.tx_enabled
            || self.bitmask != new.bitmask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeslots() {
        let params = ChannelParams::with_timeslots(0x0000_000F);
        assert_eq!(params.timeslot_count(), 4);
        assert_eq!(&params.bitmask[..5], &[0xFF, 0xFF, 0xFF, 0xFF, 0]);

        let mut tsm = [0u8; TIMESLOTS];
        tsm[4] = 0x0F;
        assert!(!params.overlaps(&tsm));
        tsm[3] = 0x80;
        assert!(params.overlaps(&tsm));
    }

    #[test]
    fn test_subchannels_cannot_share_a_timeslot() {
        let mut a = ChannelParams::default();
        a.bitmask[7] = 0x0F;
        let mut b = ChannelParams::default();
        b.bitmask[8] = 0xF0;
        assert!(!a.overlaps(&b.bitmask));
        b.bitmask[7] = 0xF0;
        assert!(a.overlaps(&b.bitmask));
    }

    #[test]
    fn test_needs_restart() {
        let base = ChannelParams::with_timeslots(0x3);
        let mut other = base.clone();
        other.idle_code = IdleCode::Ones;
        other.pad_fill_count = 4;
        assert!(!base.needs_restart(&other));
        other.mode = ChannelMode::Transparent;
        assert!(base.needs_restart(&other));
        let mut other = base.clone();
        other.bitmask[9] = 1;
        assert!(base.needs_restart(&other));
    }

    #[test]
    fn test_deserialize() {
        let params: ChannelParams =
            serde_json::from_str(r#"{"mode": "Transparent", "tx_enabled": false}"#).unwrap();
        assert_eq!(params.mode, ChannelMode::Transparent);
        assert!(params.rx_enabled);
        assert!(!params.tx_enabled);
        assert_eq!(params.timeslot_count(), 0);
        serde_json::from_str::<ChannelParams>(r#"{"speed": 64}"#).unwrap_err();
    }
}
