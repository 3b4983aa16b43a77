// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Port parameters and framer access requests.

use serde::{Deserialize, Serialize};

/// Framing of the line attached to a port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum LineMode {
    /// T1 with extended superframe.
    T1Esf,
    /// T1 with superframe.
    T1Sf,
    /// E1 with CRC4 multiframe.
    #[default]
    E1Crc,
    /// E1 without CRC4.
    E1,
    /// Unframed E1.
    E1Unframed,
}

impl LineMode {
    /// Whether the line carries 32 timeslots.
    pub fn is_e1(self) -> bool {
        matches!(self, LineMode::E1Crc | LineMode::E1 | LineMode::E1Unframed)
    }
}

/// Transmit clock source of a port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ClockSource {
    /// Recovered from the received line.
    #[default]
    Line,
    /// Card oscillator.
    Internal,
}

/// Framer loopback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum LoopbackMode {
    /// Normal operation.
    #[default]
    None,
    /// TX looped back to RX inside the framer.
    Local,
    /// Line RX looped back to line TX.
    Line,
    /// Payload looped back, framing regenerated.
    Payload,
}

/// Configuration of a port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PortParams {
    /// Line framing.
    #[serde(default)]
    pub mode: LineMode,
    /// Transmit clock source.
    #[serde(default)]
    pub clock: ClockSource,
    /// Framer loopback.
    #[serde(default)]
    pub loopback: LoopbackMode,
}

impl PortParams {
    /// Port configuration register value.
    pub fn pcd(&self) -> u32 {
        let frame = match self.mode {
            LineMode::T1Esf | LineMode::T1Sf => 0,
            LineMode::E1Crc | LineMode::E1 => 1,
            LineMode::E1Unframed => 2,
        };
        let clock = match self.clock {
            ClockSource::Line => 0,
            ClockSource::Internal => 1 << 4,
        };
        frame | clock
    }
}

/// Access to a framer register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FramerAccess {
    /// Register offset inside the port's framer.
    pub reg: u16,
    /// Value to write, `None` reads.
    #[serde(default)]
    pub value: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcd() {
        let params = PortParams::default();
        assert_eq!(params.pcd(), 1);
        let params = PortParams {
            mode: LineMode::T1Esf,
            clock: ClockSource::Internal,
            loopback: LoopbackMode::None,
        };
        assert_eq!(params.pcd(), 0x10);
        assert!(!params.mode.is_e1());
    }

    #[test]
    fn test_deserialize() {
        let params: PortParams = serde_json::from_str(r#"{"mode": "T1Sf"}"#).unwrap();
        assert_eq!(params.mode, LineMode::T1Sf);
        assert_eq!(params.loopback, LoopbackMode::None);
        let access: FramerAccess = serde_json::from_str(r#"{"reg": 16}"#).unwrap();
        assert_eq!(access.value, None);
    }
}
